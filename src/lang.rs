/// Languages the import pipeline distinguishes, keyed by file extension.
///
/// The first five families are the ones the chunker has metadata-extraction
/// tables for; the rest exist only so search filters and the per-repository
/// histogram group common ecosystems sensibly. Anything unlisted is "text",
/// which still chunks and embeds fine.
const LANGUAGES: &[(&str, &[&str])] = &[
    // Metadata-extraction families (see chunker.rs)
    ("rust", &["rs"]),
    ("python", &["py", "pyi"]),
    ("go", &["go"]),
    ("typescript", &["ts", "tsx"]),
    ("javascript", &["js", "jsx", "mjs", "cjs"]),
    ("java", &["java"]),
    ("kotlin", &["kt", "kts"]),
    ("scala", &["scala"]),
    ("csharp", &["cs"]),
    // Filter / histogram groupings
    ("c", &["c", "h"]),
    ("cpp", &["cc", "cpp", "cxx", "hpp", "hxx"]),
    ("ruby", &["rb"]),
    ("php", &["php"]),
    ("swift", &["swift"]),
    ("shell", &["sh", "bash", "zsh"]),
    ("sql", &["sql"]),
    ("html", &["html"]),
    ("css", &["css", "scss", "less"]),
    ("markdown", &["md", "rst"]),
    ("json", &["json"]),
    ("yaml", &["yaml", "yml"]),
    ("toml", &["toml"]),
    ("xml", &["xml"]),
    ("protobuf", &["proto"]),
    ("dockerfile", &["dockerfile"]),
    ("makefile", &["makefile"]),
];

/// Detect programming language from file extension.
/// Returns a static string identifier; unknown extensions map to "text".
pub fn detect_language(ext: &str) -> &'static str {
    let ext = ext.to_lowercase();
    LANGUAGES
        .iter()
        .find(|(_, extensions)| extensions.contains(&ext.as_str()))
        .map(|(name, _)| *name)
        .unwrap_or("text")
}

/// Extension of a forge-relative path, lowercased, without the leading dot.
/// Files without an extension take their full name (so "Dockerfile" and
/// "Makefile" can still be classified).
pub fn path_extension(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
        _ => name.to_lowercase(),
    }
}
