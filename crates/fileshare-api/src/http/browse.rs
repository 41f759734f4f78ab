//! Directory listing for the browser UI.
//!
//! # Design
//! - Paths resolve against the serving root exactly like uploads and archives; `..` is a 403.
//! - Dot-files and in-progress `.partial` uploads are hidden.
//! - Entries are sorted directories first, then by name, so responses are deterministic.

use std::io;
use std::path::Path;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State},
};
use fileshare_fsops::is_hidden_name;
use serde::Deserialize;
use tokio::fs;
use tracing::debug;
use url::{Url, form_urlencoded};

use crate::http::errors::ApiError;
use crate::models::{Breadcrumb, BrowseEntry, BrowseResponse, EntryKind};
use crate::state::ApiState;

const BROWSE_ROUTE: &str = "/api/browse";
const ARCHIVE_ROUTE: &str = "/zip";
const FILES_SEGMENT: &str = "files";
const LINK_ORIGIN: &str = "http://fileshare.local/";
const SIZE_UNITS: &[u8] = b"KMGTPE";

#[derive(Debug, Default, Deserialize)]
pub(crate) struct BrowseQuery {
    pub(crate) path: Option<String>,
}

pub(crate) async fn browse_directory(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<BrowseQuery>,
) -> Result<Json<BrowseResponse>, ApiError> {
    let base = state.transfer.base();
    let dir = base.resolve(query.path.as_deref().unwrap_or_default())?;
    let metadata = match fs::metadata(&dir).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(ApiError::not_found("path not found"));
        }
        Err(err) => {
            debug!(path = %dir.display(), error = %err, "browse stat failed");
            return Err(ApiError::internal("could not read directory"));
        }
    };
    if !metadata.is_dir() {
        return Err(ApiError::bad_request("path is not a directory"));
    }

    let relative = base.display_relative(&dir);
    let mut entries = list_directory(&dir, &relative).await?;
    entries.sort_by(|a, b| {
        kind_rank(a.kind)
            .cmp(&kind_rank(b.kind))
            .then_with(|| a.name.cmp(&b.name))
    });

    Ok(Json(BrowseResponse {
        breadcrumbs: breadcrumbs(&relative),
        path: relative,
        entries,
    }))
}

async fn list_directory(dir: &Path, relative: &str) -> Result<Vec<BrowseEntry>, ApiError> {
    let mut reader = fs::read_dir(dir).await.map_err(|err| {
        debug!(path = %dir.display(), error = %err, "browse read_dir failed");
        ApiError::internal("could not read directory")
    })?;
    let mut entries = Vec::new();
    loop {
        let entry = match reader.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                debug!(path = %dir.display(), error = %err, "browse entry read failed");
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_hidden_name(&name) {
            continue;
        }
        // Follows symlinks so linked directories list as directories.
        let Ok(metadata) = fs::metadata(entry.path()).await else {
            continue;
        };
        let path = if relative.is_empty() {
            name.clone()
        } else {
            format!("{relative}/{name}")
        };
        let entry = if metadata.is_dir() {
            BrowseEntry {
                download_url: query_link(ARCHIVE_ROUTE, &path),
                name,
                path,
                kind: EntryKind::Directory,
                size: None,
                size_display: None,
            }
        } else if metadata.is_file() {
            BrowseEntry {
                download_url: file_link(&path),
                name,
                path,
                kind: EntryKind::File,
                size: Some(metadata.len()),
                size_display: Some(format_size(metadata.len())),
            }
        } else {
            continue;
        };
        entries.push(entry);
    }
    Ok(entries)
}

fn breadcrumbs(relative: &str) -> Vec<Breadcrumb> {
    let mut crumbs = vec![Breadcrumb {
        name: "Home".to_string(),
        link: BROWSE_ROUTE.to_string(),
    }];
    let mut accumulated = String::new();
    for part in relative.split('/').filter(|part| !part.is_empty()) {
        if !accumulated.is_empty() {
            accumulated.push('/');
        }
        accumulated.push_str(part);
        crumbs.push(Breadcrumb {
            name: part.to_string(),
            link: query_link(BROWSE_ROUTE, &accumulated),
        });
    }
    crumbs
}

fn query_link(route: &str, path: &str) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("path", path)
        .finish();
    format!("{route}?{query}")
}

fn file_link(path: &str) -> String {
    let Ok(mut url) = Url::parse(LINK_ORIGIN) else {
        return format!("/{FILES_SEGMENT}/{path}");
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear().push(FILES_SEGMENT).extend(path.split('/'));
    }
    url.path().to_string()
}

const fn kind_rank(kind: EntryKind) -> u8 {
    match kind {
        EntryKind::Directory => 0,
        EntryKind::File => 1,
    }
}

/// Human-readable size on a 1024 base: `512 B`, `1.50 KB`, `3.00 GB`.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut rest = bytes / UNIT;
    while rest >= UNIT {
        div *= UNIT;
        exp += 1;
        rest /= UNIT;
    }
    format!(
        "{:.2} {}B",
        bytes as f64 / div as f64,
        char::from(SIZE_UNITS[exp])
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_use_a_1024_base() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1.00 KB");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(10 * 1024 * 1024), "10.00 MB");
        assert_eq!(format_size(u64::MAX), "16.00 EB");
    }

    #[test]
    fn breadcrumbs_accumulate_segments() {
        let crumbs = breadcrumbs("photos/summer trip");
        let names: Vec<_> = crumbs.iter().map(|crumb| crumb.name.as_str()).collect();
        assert_eq!(names, ["Home", "photos", "summer trip"]);
        assert_eq!(crumbs[0].link, "/api/browse");
        assert_eq!(crumbs[2].link, "/api/browse?path=photos%2Fsummer+trip");
    }

    #[test]
    fn links_are_encoded() {
        assert_eq!(file_link("docs/a b#1.txt"), "/files/docs/a%20b%231.txt");
        assert_eq!(query_link(ARCHIVE_ROUTE, "a&b"), "/zip?path=a%26b");
    }
}
