use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("invalid playlist URL `{url}`: {source}")]
    MalformedUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unrecognized playlist format for `{url}` (expected .mpd or .m3u8)")]
    UnknownFormat { url: String },

    #[error("manifest `{url}` is missing required field `{field}`")]
    MissingManifestField { url: String, field: &'static str },

    #[error("playlist fetch failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("DASH manifest parse error in `{url}`: {source}")]
    DashParse {
        url: String,
        #[source]
        source: quick_xml::Error,
    },

    #[error("HLS playlist parse error in `{url}`: {reason}")]
    HlsParse { url: String, reason: String },
}

impl LoaderError {
    pub fn missing_field(url: &url::Url, field: &'static str) -> Self {
        Self::MissingManifestField { url: url.to_string(), field }
    }
}
