use std::sync::Arc;

use bmc_api_types::{Comic, ComicInfo, ComicSource};
use bmc_sources::{PageDocument, SourceAdapter, SourceRegistry};
use serde_json::{Value, json};
use tracing::debug;

pub const LOCALHOST: &str = "localhost";

/// Adapter for the local test reader, which serves
/// `/<name>/<chapter>/<page>` pages.
///
/// Reads `BMC_LOCALHOST_URL` from environment at construction time
/// (default: `http://localhost:5000`).
pub struct LocalhostReader {
    base_url: String,
}

impl Default for LocalhostReader {
    fn default() -> Self {
        Self::new(None)
    }
}

impl LocalhostReader {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url
            .or_else(|| std::env::var("BMC_LOCALHOST_URL").ok())
            .unwrap_or_else(|| "http://localhost:5000".to_string());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Host and port the reader is served from.
    pub fn authority(&self) -> &str {
        self.base_url
            .split_once("://")
            .map_or(self.base_url.as_str(), |(_, rest)| rest)
    }

    /// Registers the adapter under its reader name and under its authority,
    /// so page origins carrying a port still find it.
    pub fn install(self, registry: &mut SourceRegistry) {
        let authority = self.authority().to_owned();
        let adapter: Arc<dyn SourceAdapter> = Arc::new(self);
        registry.register(adapter.clone());
        if authority != LOCALHOST {
            registry.register_as(authority, adapter);
        }
    }
}

/// Path segments of `url`, without scheme, host and query.
fn path_segments(url: &str) -> Vec<&str> {
    let path = match url.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, path)| path).unwrap_or(""),
        None => url,
    };
    let path = path.split(['?', '#']).next().unwrap_or("");
    path.split('/').filter(|part| !part.is_empty()).collect()
}

impl SourceAdapter for LocalhostReader {
    fn reader(&self) -> &str {
        LOCALHOST
    }

    fn get_infos(&self, url: &str, _document: Option<&dyn PageDocument>) -> Option<ComicInfo> {
        let parts = path_segments(url);
        let name = parts.first()?;
        let number = |index: usize| parts.get(index).and_then(|part| part.parse::<u32>().ok());

        let mut info = ComicInfo::new(*name, number(1), number(2));
        info.extra.insert("id".to_owned(), json!(name));
        debug!(%url, ?info, "parsed localhost page");
        Some(info)
    }

    fn compute_url(&self, comic: &Comic, source: &ComicSource) -> Option<String> {
        let id = match source.info.get("id") {
            Some(Value::String(id)) => id.as_str(),
            _ => source.name.as_str(),
        };
        let tracking = comic.tracking();
        let url = match (tracking.chapter, tracking.page) {
            (Some(chapter), Some(page)) => format!("{}/{id}/{chapter}/{page}", self.base_url),
            (Some(chapter), None) => format!("{}/{id}/{chapter}", self.base_url),
            _ => format!("{}/{id}", self.base_url),
        };
        Some(url)
    }

    fn has_next_page(&self, document: &dyn PageDocument) -> bool {
        document.exists("body>div#buttons>button#next") || document.exists("body>div#buttons>button#next-page")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bmc_api_types::{ComicRecord, Tracking};

    fn reader() -> LocalhostReader {
        LocalhostReader::new(Some("http://localhost:5000/".to_owned()))
    }

    fn comic(tracking: Tracking) -> Comic {
        let mut comic = Comic::new(ComicRecord {
            label: "a3".to_owned(),
            id: 0,
            tracking,
        });
        let source = reader().get_infos("/a3/2/4", None).unwrap().source(LOCALHOST);
        comic.add_source(source).unwrap();
        comic
    }

    #[test]
    fn parses_name_chapter_and_page() {
        let info = reader().get_infos("http://localhost:5000/a3/2/4?ajax", None).unwrap();
        assert_eq!(info.common.name, "a3");
        assert_eq!((info.common.chapter, info.common.page), (Some(2), Some(4)));
        assert_eq!(info.extra["id"], json!("a3"));

        let home = reader().get_infos("/a3", None).unwrap();
        assert_eq!((home.common.chapter, home.common.page), (None, None));
        assert!(reader().get_infos("http://localhost:5000/", None).is_none());
    }

    #[test]
    fn url_depth_follows_tracking() {
        let reader = reader();
        let cases = [
            (Tracking::new(2, Some(4)), "http://localhost:5000/a3/2/4"),
            (Tracking::new(2, None), "http://localhost:5000/a3/2"),
            (Tracking::default(), "http://localhost:5000/a3"),
        ];
        for (tracking, expected) in cases {
            let comic = comic(tracking);
            let source = comic.source_for(LOCALHOST).unwrap();
            assert_eq!(reader.compute_url(&comic, source).as_deref(), Some(expected));
        }
    }

    #[test]
    fn origin_with_port_reaches_the_adapter() -> anyhow::Result<()> {
        let mut registry = SourceRegistry::default();
        reader().install(&mut registry);
        assert_eq!(registry.readers(), vec!["localhost", "localhost:5000"]);

        let url = registry.compute_url("http://localhost:5000", &comic(Tracking::new(3, Some(1))))?;
        assert_eq!(url, "http://localhost:5000/a3/3/1");
        Ok(())
    }
}
