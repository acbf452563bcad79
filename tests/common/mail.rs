//! Helpers for digging links out of recorded mail bodies.

/// Returns the first link in `html` containing `marker`, with HTML entities
/// in the query string decoded.
pub fn extract_link(html: &str, marker: &str) -> Option<String> {
    let marker_pos = html.find(marker)?;
    let start = html[..marker_pos]
        .rfind(|c: char| c == '"' || c == '>' || c.is_whitespace())
        .map(|i| i + 1)
        .unwrap_or(0);
    let rest = &html[start..];
    let end = rest
        .find(|c: char| c == '"' || c == '<' || c.is_whitespace())
        .unwrap_or(rest.len());
    Some(rest[..end].replace("&amp;", "&"))
}

/// Decoded value of a query parameter.
pub fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == name {
            urlencoding::decode(value).ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}
