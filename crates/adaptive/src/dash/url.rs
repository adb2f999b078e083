use dash_mpd::BaseURL;
use url::Url;

use crate::error::IoriResult;

pub(crate) fn is_absolute_url(s: &str) -> bool {
    s.starts_with("http://")
        || s.starts_with("https://")
        || s.starts_with("file://")
        || s.starts_with("ftp://")
}

/// Resolves `new` against `current`, carrying over the query of `current` when `new` has none.
///
/// Tokenized CDNs put their credentials in the manifest query, and every
/// relative segment URL has to keep them:
///
/// `https://example.com/manifest.mpd?auth=secret` + `/video42.mp4` =>
/// `https://example.com/video42.mp4?auth=secret`
pub(crate) fn merge_base_urls(current: &Url, new: &str) -> IoriResult<Url> {
    if is_absolute_url(new) {
        return Ok(Url::parse(new)?);
    }
    let mut merged = current.join(new)?;
    if merged.query().is_none() {
        merged.set_query(current.query());
    }
    Ok(merged)
}

/// Descends one level of the `BaseURL` hierarchy. Only the first `BaseURL` is used.
pub(crate) fn nested_base_url(current: &Url, elements: &[BaseURL]) -> IoriResult<Url> {
    match elements.first() {
        Some(element) => merge_base_urls(current, element.base.trim()),
        None => Ok(current.clone()),
    }
}
