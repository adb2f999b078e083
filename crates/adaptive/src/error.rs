use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum IoriError {
    #[error("Invalid playlist at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Delta update failed: can not skip {skipped} segments from media sequence {media_sequence}")]
    DeltaUpdateFailed { media_sequence: u64, skipped: u64 },

    #[error("Manifest is stale after {attempts} attempts")]
    StaleManifest { attempts: u32 },

    #[error("Playlist {0} is stuck")]
    PlaylistStuck(Url),

    #[error("Playlist {0} was reset")]
    PlaylistReset(Url),

    #[error("Fell behind the live window")]
    BehindLiveWindow,

    #[error("Can not exclude track {0}: it is the last usable track")]
    TrackExclusionExhausted(usize),

    #[error("No track to select from")]
    NoTracks,

    #[error("A dynamic manifest can not be sideloaded")]
    UnsupportedSideload,

    #[error("Load canceled")]
    Canceled,

    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    // MPEG-DASH errors
    #[error(transparent)]
    MpdParseError(#[from] dash_mpd::DashMpdError),

    #[error("Invalid timing schema: {0:?}")]
    InvalidTimingSchema(String),

    #[error(transparent)]
    DateTimeParsing(#[from] chrono::ParseError),
}

impl IoriError {
    pub(crate) fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::ParseError {
            line,
            message: message.into(),
        }
    }

    /// Whether the resource can still make progress after this error by loading again.
    ///
    /// `BehindLiveWindow` is reported as unrecoverable here: playback control has to
    /// reposition before anything else is requested.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::DeltaUpdateFailed { .. }
            | Self::ParseError { .. }
            | Self::PlaylistStuck(_)
            | Self::PlaylistReset(_)
            | Self::HttpError(_)
            | Self::RequestError(_)
            | Self::IOError(_)
            | Self::MpdParseError(_)
            | Self::DateTimeParsing(_)
            | Self::InvalidTimingSchema(_) => true,
            Self::StaleManifest { .. }
            | Self::BehindLiveWindow
            | Self::TrackExclusionExhausted(_)
            | Self::UnsupportedSideload
            | Self::NoTracks
            | Self::Canceled
            | Self::UrlParseError(_) => false,
        }
    }

    /// HTTP status of the failed request, if the error carries one.
    pub fn status(&self) -> Option<reqwest::StatusCode> {
        match self {
            Self::HttpError(status) => Some(*status),
            Self::RequestError(e) => e.status(),
            _ => None,
        }
    }
}

pub type IoriResult<T> = Result<T, IoriError>;
