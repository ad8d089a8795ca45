use url::Url;

use crate::error::KaikoResult;

/// Resolves `reference` against `base`, the way nested `BaseURL` elements stack up.
///
/// A relative reference without a query string inherits the query of `base`, which keeps
/// signed manifest parameters on every derived segment URL:
///
/// ```text
/// https://cdn/live/manifest.mpd?sig=abc + v/init.m4v     => https://cdn/live/v/init.m4v?sig=abc
/// https://cdn/live/manifest.mpd?sig=abc + v/1.m4v?sig=x  => https://cdn/live/v/1.m4v?sig=x
/// ```
pub(crate) fn merge_baseurls(base: &Url, reference: &str) -> KaikoResult<Url> {
    if let Ok(absolute) = Url::parse(reference) {
        return Ok(absolute);
    }

    let mut merged = base.join(reference)?;
    if merged.query().is_none() {
        merged.set_query(base.query());
    }
    Ok(merged)
}

/// Applies every level of `BaseURL` in order, outermost first.
pub(crate) fn resolve_base<'a, I>(manifest_url: &Url, levels: I) -> KaikoResult<Url>
where
    I: IntoIterator<Item = &'a str>,
{
    levels
        .into_iter()
        .try_fold(manifest_url.clone(), |base, level| merge_baseurls(&base, level))
}
