use std::fs;
use std::path::{Path, PathBuf};

fn collect_rs_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rs_files(&path, out);
        } else if path.extension().and_then(|s| s.to_str()) == Some("rs") {
            out.push(path);
        }
    }
}

/// Panel sources plus the database crate.
fn source_files() -> Vec<PathBuf> {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut files = Vec::new();
    collect_rs_files(&manifest.join("src"), &mut files);
    collect_rs_files(&manifest.join("../../libs/ferry-db/src"), &mut files);
    files
}

fn line_number(content: &str, byte_idx: usize) -> usize {
    content[..byte_idx].bytes().filter(|b| *b == b'\n').count() + 1
}

fn parse_sql_literal_from_call(content: &str, call_idx: usize) -> Option<(usize, String)> {
    let open_paren_rel = content[call_idx..].find('(')?;
    let mut i = call_idx + open_paren_rel + 1;
    let bytes = content.as_bytes();

    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if i >= bytes.len() {
        return None;
    }

    // r"..." or r#"..."#
    if bytes[i] == b'r' {
        let mut j = i + 1;
        let mut hashes = 0usize;
        while j < bytes.len() && bytes[j] == b'#' {
            hashes += 1;
            j += 1;
        }
        if j >= bytes.len() || bytes[j] != b'"' {
            return None;
        }
        let start = j + 1;
        let mut end_marker = String::from("\"");
        end_marker.push_str(&"#".repeat(hashes));
        let end_rel = content[start..].find(&end_marker)?;
        return Some((i, content[start..start + end_rel].to_string()));
    }

    if bytes[i] == b'"' {
        let start = i + 1;
        let mut j = start;
        let mut escaped = false;
        while j < bytes.len() {
            let b = bytes[j];
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                return Some((i, content[start..j].to_string()));
            }
            j += 1;
        }
    }

    None
}

fn extract_sql_literals(content: &str) -> Vec<(usize, String)> {
    let mut result = Vec::new();
    let mut pos = 0usize;
    while let Some(rel) = content[pos..].find("sqlx::query") {
        let idx = pos + rel;
        if let Some(parsed) = parse_sql_literal_from_call(content, idx) {
            result.push(parsed);
        }
        pos = idx + "sqlx::query".len();
    }
    result
}

fn violations(check: impl Fn(&str) -> bool, what: &str) -> Vec<String> {
    let mut found = Vec::new();
    for file in source_files() {
        let Ok(content) = fs::read_to_string(&file) else {
            continue;
        };
        for (byte_idx, sql) in extract_sql_literals(&content) {
            if check(&sql) {
                found.push(format!("{}:{} {}", file.display(), line_number(&content, byte_idx), what));
            }
        }
    }
    found
}

#[test]
fn sqlx_queries_use_postgres_placeholders() {
    let found = violations(|sql| sql.contains('?'), "contains '?' placeholder");
    assert!(found.is_empty(), "Found non-Postgres placeholders:\n{}", found.join("\n"));
}

#[test]
fn sqlx_queries_avoid_sqlite_and_mysql_syntax() {
    let found = violations(
        |sql| {
            let lower = sql.to_lowercase();
            lower.contains("insert or ignore")
                || lower.contains("insert or replace")
                || lower.contains("autoincrement")
                || lower.contains("strftime(")
                || lower.contains("datetime(")
                || lower.contains("unix_timestamp(")
                || lower.contains("on duplicate key")
                || sql.contains('`')
        },
        "contains SQLite/MySQL-only syntax",
    );
    assert!(found.is_empty(), "Found non-Postgres SQL:\n{}", found.join("\n"));
}

#[test]
fn guard_sees_repository_queries() {
    let total: usize = source_files()
        .iter()
        .filter_map(|f| fs::read_to_string(f).ok())
        .map(|c| extract_sql_literals(&c).len())
        .sum();
    assert!(total > 20, "expected to find repository queries, found {}", total);
}
