//! Save-path derivation for downloads.
//!
//! The save name comes from, in order: the explicit `save_file_name`, a
//! `content-disposition` filename directive embedded in the URL query
//! (CDN style, e.g. `?response-content-disposition=attachment;
//! filename=test.exe`), the URL path basename, and finally the literal
//! `download`. Collisions without `overwrite` get a `_1`..`_99` suffix.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use url::Url;

use crate::types::{DownloadConfig, RequestContext};

/// Fallback when URL and query yield nothing usable.
const DEFAULT_FILENAME: &str = "download";

/// Characters never allowed in a derived filename.
const FORBIDDEN: &[char] = &['\\', '/', '|', '"', ':', '<', '>'];

/// Derives the save file name for `ctx` (explicit name, query directive,
/// URL basename, `download` — in that order).
pub fn save_file_name(ctx: &RequestContext) -> String {
    let cfg = ctx.download.as_ref();
    if let Some(cfg) = cfg {
        if !cfg.save_file_name.is_empty() {
            return cfg.save_file_name.clone();
        }
    }

    let parsed = match Url::parse(&ctx.url) {
        Ok(u) => u,
        Err(_) => return DEFAULT_FILENAME.to_string(),
    };

    let mut name = filename_from_query(&parsed).unwrap_or_default();
    if name.is_empty() {
        name = parsed
            .path_segments()
            .and_then(|segments| segments.last().map(str::to_string))
            .map(|s| strip_forbidden(&s))
            .unwrap_or_default();
    }
    if name.is_empty() {
        name = DEFAULT_FILENAME.to_string();
    }
    name
}

/// `filename=` directive from a `response-content-disposition` or
/// `content-disposition` query parameter, with `\ / | " : < >` stripped.
fn filename_from_query(url: &Url) -> Option<String> {
    for (key, value) in url.query_pairs() {
        if !key.eq_ignore_ascii_case("response-content-disposition")
            && !key.eq_ignore_ascii_case("content-disposition")
        {
            continue;
        }
        for piece in value.split(';') {
            let piece = piece.trim();
            let Some(prefix) = piece.get(..9) else { continue };
            if prefix.eq_ignore_ascii_case("filename=") {
                let name = strip_forbidden(&piece[9..]);
                if !name.is_empty() {
                    return Some(name);
                }
            }
        }
        return None;
    }
    None
}

fn strip_forbidden(name: &str) -> String {
    name.chars().filter(|c| !FORBIDDEN.contains(c)).collect()
}

/// Resolves the final destination path for a download: ensures the save
/// directory exists, then applies the overwrite/suffix policy. With
/// `overwrite` the existing file is removed here; otherwise a free name is
/// found by appending `_1`..`_99` before the extension.
pub fn resolve_save_path(ctx: &RequestContext, cfg: &DownloadConfig) -> Result<PathBuf> {
    if cfg.save_dir.as_os_str().is_empty() {
        bail!("Configuration error: save directory cannot be empty");
    }
    std::fs::create_dir_all(&cfg.save_dir).with_context(|| {
        format!(
            "File system error: failed to create directory path - {}",
            cfg.save_dir.display()
        )
    })?;

    let name = save_file_name(ctx);
    let path = cfg.save_dir.join(&name);
    if !path.exists() {
        return Ok(path);
    }

    if cfg.overwrite {
        std::fs::remove_file(&path).with_context(|| {
            format!(
                "File operation failed: unable to remove existing file '{}'",
                path.display()
            )
        })?;
        return Ok(path);
    }

    for i in 1..100 {
        let candidate = cfg.save_dir.join(suffixed(&name, i));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    bail!(
        "File conflict: no free name for '{}' in {}",
        name,
        cfg.save_dir.display()
    );
}

/// `file.bin` -> `file_3.bin`; `file` -> `file_3`.
fn suffixed(name: &str, i: u32) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{}{}", &name[..dot], i, &name[dot..]),
        _ => format!("{}_{}", name, i),
    }
}

/// Temp-file path for an in-progress download: `<dir>/<uuid>.<ext|tmp>`.
pub fn temp_download_path(final_path: &Path) -> PathBuf {
    let dir = final_path.parent().unwrap_or_else(|| Path::new("."));
    let suffix = final_path
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .unwrap_or("tmp");
    dir.join(format!("{}.{}", uuid::Uuid::new_v4(), suffix))
}
