use reqwest::header::HeaderMap;

/// Page number of the `rel="next"` entry in an RFC 8288 `Link` header.
pub(crate) fn next_page_from_link_header(headers: &HeaderMap) -> Option<u32> {
    let link = headers.get("link")?.to_str().ok()?;
    link.split(',')
        .map(str::trim)
        .filter(|part| part.contains("rel=\"next\""))
        .find_map(|part| {
            let start = part.find('<')? + 1;
            let end = part.find('>')?;
            let query = part.get(start..end)?.split_once('?')?.1;
            query.split('&').find_map(|pair| {
                let (key, value) = pair.split_once('=')?;
                (key == "page").then(|| value.parse::<u32>().ok()).flatten()
            })
        })
}

/// Numeric page header such as GitLab's `x-next-page`; empty on the last page.
pub(crate) fn next_page_from_header(headers: &HeaderMap, name: &str) -> Option<u32> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u32>().ok())
}
