//! Per-platform file requirements.
//!
//! A requirement written as `a|b` is satisfied by either path.

#[derive(Debug, Clone, Copy)]
pub struct PlatformRequirements {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    /// Missing any of these is critical.
    pub required: &'static [&'static str],
    pub recommended: &'static [&'static str],
    /// Fewest artifacts a well-formed tree can have.
    pub min_artifacts: usize,
    /// At least one artifact must live under one of these directories. Empty means flat is fine.
    pub source_dirs: &'static [&'static str],
    /// Candidates for the document the preview loads first.
    pub entry_documents: &'static [&'static str],
    /// The entry document must reference one of these. Empty means the framework wires it up.
    pub bootstrap: &'static [&'static str],
}

pub const PLATFORMS: &[PlatformRequirements] = &[
    PlatformRequirements {
        name: "react",
        aliases: &["react-vite", "vite-react", "react-ts"],
        required: &[
            "package.json",
            "index.html",
            "src/main.tsx|src/main.jsx",
            "src/App.tsx|src/App.jsx",
        ],
        recommended: &[
            "vite.config.ts|vite.config.js",
            "tsconfig.json",
            "src/index.css|src/App.css",
            "README.md",
        ],
        min_artifacts: 4,
        source_dirs: &["src"],
        entry_documents: &["index.html"],
        bootstrap: &["src/main.tsx", "src/main.jsx"],
    },
    PlatformRequirements {
        name: "vue",
        aliases: &["vue3", "vue-vite"],
        required: &[
            "package.json",
            "index.html",
            "src/main.ts|src/main.js",
            "src/App.vue",
        ],
        recommended: &["vite.config.ts|vite.config.js", "README.md"],
        min_artifacts: 4,
        source_dirs: &["src"],
        entry_documents: &["index.html"],
        bootstrap: &["src/main.ts", "src/main.js"],
    },
    PlatformRequirements {
        name: "svelte",
        aliases: &["svelte-vite"],
        required: &[
            "package.json",
            "index.html",
            "src/main.ts|src/main.js",
            "src/App.svelte",
        ],
        recommended: &["vite.config.ts|vite.config.js", "svelte.config.js", "README.md"],
        min_artifacts: 4,
        source_dirs: &["src"],
        entry_documents: &["index.html"],
        bootstrap: &["src/main.ts", "src/main.js"],
    },
    PlatformRequirements {
        name: "nextjs",
        aliases: &["next", "next.js"],
        required: &[
            "package.json",
            "app/page.tsx|app/page.jsx|pages/index.tsx|pages/index.jsx",
        ],
        recommended: &[
            "next.config.js|next.config.mjs|next.config.ts",
            "tsconfig.json",
            "app/layout.tsx|app/layout.jsx|pages/_app.tsx|pages/_app.jsx",
        ],
        min_artifacts: 2,
        source_dirs: &["app", "pages"],
        entry_documents: &[
            "app/page.tsx",
            "app/page.jsx",
            "pages/index.tsx",
            "pages/index.jsx",
        ],
        bootstrap: &[],
    },
    PlatformRequirements {
        name: "vanilla",
        aliases: &["html", "static", "vanilla-js"],
        required: &["index.html"],
        recommended: &["styles.css|style.css|css/styles.css", "script.js|main.js|js/main.js"],
        min_artifacts: 1,
        source_dirs: &[],
        entry_documents: &["index.html"],
        bootstrap: &[],
    },
];

pub fn requirements_for(platform: &str) -> Option<&'static PlatformRequirements> {
    let wanted = platform.trim().to_lowercase();
    PLATFORMS
        .iter()
        .find(|p| p.name == wanted || p.aliases.contains(&wanted.as_str()))
}

pub fn known_platforms() -> Vec<&'static str> {
    PLATFORMS.iter().map(|p| p.name).collect()
}

/// Split an `a|b` requirement into its alternatives.
pub fn alternatives(requirement: &str) -> impl Iterator<Item = &str> {
    requirement.split('|').map(str::trim).filter(|s| !s.is_empty())
}
