//! Line-window chunking of imported file content.
//!
//! Files are split into fixed-size overlapping line windows; each window is
//! content-hashed for deduplication and annotated with a cheap regex-based
//! symbol summary. Output is deterministic for equal input and parameters.

use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};

use crate::config::{
    AppConfig, EXCLUDED_DIRECTORIES, EXCLUDED_FILES, EXCLUDED_SUFFIXES, MIN_TAIL_LINES,
};
use crate::lang::{detect_language, path_extension};
use crate::models::{ChunkMetadata, NewChunk};

/// Bytes inspected for NUL when deciding whether a file is binary.
const BINARY_SNIFF_BYTES: usize = 8192;

pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
    max_file_size: u64,
    exclusions: GlobSet,
}

impl Chunker {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            overlap: config.chunk_overlap,
            max_file_size: config.github_max_file_size,
            exclusions: build_exclusion_set(),
        }
    }

    /// Whether a forge-relative path should be skipped without fetching.
    /// Matches vendored/build directories, dotfiles, lockfiles and generated
    /// artifacts.
    pub fn should_skip_path(&self, path: &str) -> bool {
        if self.exclusions.is_match(path) {
            return true;
        }
        // Dotfiles and dot-directories anywhere in the path.
        path.split('/').any(|c| c.starts_with('.') && c.len() > 1)
    }

    /// Split file content into overlapping line-window chunks.
    /// Returns an empty vec for skipped files (binary, oversized, excluded).
    pub fn chunk_file(&self, file_path: &str, bytes: &[u8]) -> Vec<NewChunk> {
        if self.should_skip_path(file_path) {
            return Vec::new();
        }
        if bytes.len() as u64 > self.max_file_size {
            return Vec::new();
        }
        let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
        if sniff.contains(&0) {
            return Vec::new();
        }

        // Invalid UTF-8 sequences are replaced, never a failure.
        let content = String::from_utf8_lossy(bytes).replace("\r\n", "\n").replace('\r', "\n");
        let lines: Vec<&str> = content.lines().collect();
        if lines.is_empty() {
            return Vec::new();
        }

        let file_name = file_path.rsplit('/').next().unwrap_or(file_path).to_string();
        let language = detect_language(&path_extension(file_path)).to_string();

        let step = self.chunk_size - self.overlap;
        let mut windows: Vec<(usize, usize)> = Vec::new(); // 0-based [start, end)
        let mut start = 0usize;
        loop {
            let end = (start + self.chunk_size).min(lines.len());
            windows.push((start, end));
            if end >= lines.len() {
                break;
            }
            start += step;
        }

        // A short end-of-file window carries too little context on its own;
        // fold it into the previous window instead.
        if windows.len() > 1 {
            let (tail_start, last_end) = windows[windows.len() - 1];
            if last_end - tail_start < MIN_TAIL_LINES {
                windows.pop();
                let prev = windows.len() - 1;
                windows[prev].1 = last_end;
            }
        }

        windows
            .into_iter()
            .map(|(s, e)| {
                let chunk_content = lines[s..e].join("\n");
                let content_hash = hash_content(&chunk_content);
                let metadata = extract_metadata(&chunk_content, &language);
                NewChunk {
                    file_path: file_path.to_string(),
                    file_name: file_name.clone(),
                    language: language.clone(),
                    start_line: (s + 1) as i32,
                    end_line: e as i32,
                    content: chunk_content,
                    content_hash,
                    metadata,
                }
            })
            .collect()
    }
}

/// SHA-256 hex digest of chunk content, the dedup key within a repository.
pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn build_exclusion_set() -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for dir in EXCLUDED_DIRECTORIES {
        for pattern in [format!("{dir}/**"), format!("**/{dir}/**")] {
            if let Ok(glob) = Glob::new(&pattern) {
                builder.add(glob);
            }
        }
    }
    for file in EXCLUDED_FILES {
        for pattern in [(*file).to_string(), format!("**/{file}")] {
            if let Ok(glob) = Glob::new(&pattern) {
                builder.add(glob);
            }
        }
    }
    for suffix in EXCLUDED_SUFFIXES {
        if let Ok(glob) = Glob::new(&format!("**/*{suffix}")) {
            builder.add(glob);
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

// ---------------------------------------------------------------------------
// Regex-based metadata extraction
// ---------------------------------------------------------------------------

/// Best-effort symbol and complexity summary of a chunk. Never fails; a
/// language without patterns yields empty symbol lists.
fn extract_metadata(content: &str, language: &str) -> ChunkMetadata {
    use regex::Regex;
    use std::sync::LazyLock;

    struct LangPatterns {
        functions: Vec<Regex>,
        classes: Vec<Regex>,
        imports: Regex,
    }

    static TS_JS: LazyLock<LangPatterns> = LazyLock::new(|| LangPatterns {
        functions: vec![
            Regex::new(r"(?m)^\s*(?:export\s+)?(?:async\s+)?function\s+(\w+)").unwrap(),
            Regex::new(r"(?m)^\s*(?:export\s+)?const\s+(\w+)\s*=\s*(?:async\s+)?\(").unwrap(),
        ],
        classes: vec![
            Regex::new(r"(?m)^\s*(?:export\s+)?(?:abstract\s+)?class\s+(\w+)").unwrap(),
            Regex::new(r"(?m)^\s*(?:export\s+)?interface\s+(\w+)").unwrap(),
        ],
        imports: Regex::new(r"(?m)^\s*import\s+.+$").unwrap(),
    });

    static RUST: LazyLock<LangPatterns> = LazyLock::new(|| LangPatterns {
        functions: vec![
            Regex::new(r"(?m)^\s*(?:pub(?:\([\w:\s]+\))?\s+)?(?:async\s+)?fn\s+(\w+)").unwrap(),
        ],
        classes: vec![
            Regex::new(r"(?m)^\s*(?:pub(?:\([\w:\s]+\))?\s+)?struct\s+(\w+)").unwrap(),
            Regex::new(r"(?m)^\s*(?:pub(?:\([\w:\s]+\))?\s+)?enum\s+(\w+)").unwrap(),
            Regex::new(r"(?m)^\s*(?:pub(?:\([\w:\s]+\))?\s+)?trait\s+(\w+)").unwrap(),
        ],
        imports: Regex::new(r"(?m)^\s*use\s+.+$").unwrap(),
    });

    static PYTHON: LazyLock<LangPatterns> = LazyLock::new(|| LangPatterns {
        functions: vec![Regex::new(r"(?m)^\s*(?:async\s+)?def\s+(\w+)").unwrap()],
        classes: vec![Regex::new(r"(?m)^\s*class\s+(\w+)").unwrap()],
        imports: Regex::new(r"(?m)^\s*(?:from\s+\S+\s+)?import\s+.+$").unwrap(),
    });

    static GO: LazyLock<LangPatterns> = LazyLock::new(|| LangPatterns {
        functions: vec![Regex::new(r"(?m)^func\s+(?:\([^)]+\)\s+)?(\w+)").unwrap()],
        classes: vec![Regex::new(r"(?m)^type\s+(\w+)\s+(?:struct|interface)").unwrap()],
        imports: Regex::new(r#"(?m)^\s*import\s+.+$|^\s+"[\w./-]+"$"#).unwrap(),
    });

    static JAVA_LIKE: LazyLock<LangPatterns> = LazyLock::new(|| LangPatterns {
        functions: vec![
            Regex::new(
                r"(?m)^\s*(?:public|private|protected)\s+(?:static\s+)?[\w<>\[\]]+\s+(\w+)\s*\(",
            )
            .unwrap(),
        ],
        classes: vec![
            Regex::new(r"(?m)^\s*(?:public\s+)?(?:abstract\s+)?(?:class|interface|enum)\s+(\w+)")
                .unwrap(),
        ],
        imports: Regex::new(r"(?m)^\s*import\s+.+$").unwrap(),
    });

    static CONTROL_FLOW: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\b(if|else|for|while|match|switch|case|catch|except|loop)\b").unwrap()
    });

    let patterns: Option<&LangPatterns> = match language {
        "typescript" | "javascript" => Some(&TS_JS),
        "rust" => Some(&RUST),
        "python" => Some(&PYTHON),
        "go" => Some(&GO),
        "java" | "kotlin" | "scala" | "csharp" => Some(&JAVA_LIKE),
        _ => None,
    };

    let complexity = CONTROL_FLOW.find_iter(content).count() as u32;

    let Some(patterns) = patterns else {
        return ChunkMetadata {
            complexity,
            ..ChunkMetadata::default()
        };
    };

    let mut seen = std::collections::HashSet::new();
    let mut collect = |regexes: &[regex::Regex]| -> Vec<String> {
        let mut names = Vec::new();
        for re in regexes {
            for cap in re.captures_iter(content) {
                if let Some(name) = cap.get(1) {
                    let sym = name.as_str();
                    if sym.len() >= 2 && seen.insert(sym.to_string()) {
                        names.push(sym.to_string());
                    }
                }
            }
        }
        names
    };

    let functions = collect(&patterns.functions);
    let classes = collect(&patterns.classes);
    let imports: Vec<String> = patterns
        .imports
        .find_iter(content)
        .take(32)
        .map(|m| m.as_str().trim().to_string())
        .collect();

    ChunkMetadata {
        functions,
        classes,
        imports,
        complexity,
    }
}
