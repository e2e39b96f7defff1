//! Audience targeting. A malformed predicate means "not targeted"; nothing
//! here returns an error.

use abtrack_core::types::{AudienceContext, AudienceRule, DeviceClass};
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueryPredicate<'a> {
    key: &'a str,
    value: Option<&'a str>,
    negate: bool,
}

fn parse_query_rule(rule: &str) -> Option<QueryPredicate<'_>> {
    let rule = rule.trim();
    let (negate, body) = match rule.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, rule),
    };
    let (key, value) = match body.split_once('=') {
        Some((key, value)) => (key.trim(), Some(value.trim())),
        None => (body.trim(), None),
    };
    if key.is_empty() || value == Some("") {
        return None;
    }
    Some(QueryPredicate { key, value, negate })
}

fn query_matches(rule: &str, url: &str) -> bool {
    let Some(predicate) = parse_query_rule(rule) else {
        debug!(rule = rule, "Malformed query rule, visitor not targeted");
        return false;
    };
    let Ok(url) = Url::parse(url) else {
        debug!(url = url, "Unparsable page URL, visitor not targeted");
        return false;
    };
    let present = url.query_pairs().any(|(k, v)| {
        k == predicate.key && predicate.value.map_or(true, |expected| v == expected)
    });
    present != predicate.negate
}

fn device_matches(devices: &[DeviceClass], device: DeviceClass) -> bool {
    // An empty allow-list targets nobody.
    devices.contains(&device)
}

/// Query predicate first, then device class.
pub fn is_targeted(rule: &AudienceRule, ctx: &AudienceContext) -> bool {
    if let Some(query) = &rule.query {
        if !query_matches(query, &ctx.url) {
            return false;
        }
    }
    if let Some(devices) = &rule.devices {
        if !device_matches(devices, ctx.device) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(url: &str, device: DeviceClass) -> AudienceContext {
        AudienceContext {
            url: url.into(),
            device,
            is_local_dev: false,
        }
    }

    fn rule(query: Option<&str>, devices: Option<Vec<DeviceClass>>) -> AudienceRule {
        AudienceRule {
            query: query.map(String::from),
            devices,
        }
    }

    #[test]
    fn test_parse_query_rule() {
        assert_eq!(
            parse_query_rule("!utm_source=ads"),
            Some(QueryPredicate {
                key: "utm_source",
                value: Some("ads"),
                negate: true
            })
        );
        assert_eq!(parse_query_rule("=x"), None);
        assert_eq!(parse_query_rule("ref="), None);
        assert_eq!(parse_query_rule("!"), None);
    }

    #[test]
    fn test_query_presence_and_value() {
        let page = ctx("https://shop.test/p?utm_source=ads&x=1", DeviceClass::Desktop);
        assert!(is_targeted(&rule(Some("utm_source"), None), &page));
        assert!(is_targeted(&rule(Some("utm_source=ads"), None), &page));
        assert!(!is_targeted(&rule(Some("utm_source=mail"), None), &page));
        assert!(!is_targeted(&rule(Some("!x"), None), &page));
        assert!(is_targeted(&rule(Some("!promo"), None), &page));
    }

    #[test]
    fn test_malformed_inputs_are_not_targeted() {
        let page = ctx("https://shop.test/?a=1", DeviceClass::Mobile);
        assert!(!is_targeted(&rule(Some("a="), None), &page));
        assert!(!is_targeted(&rule(None, Some(vec![])), &page));
        let broken = ctx("not a url", DeviceClass::Mobile);
        assert!(!is_targeted(&rule(Some("a"), None), &broken));
    }

    #[test]
    fn test_device_classes() {
        let page = ctx("https://shop.test/", DeviceClass::Tablet);
        assert!(is_targeted(
            &rule(None, Some(vec![DeviceClass::Tablet, DeviceClass::Mobile])),
            &page
        ));
        assert!(!is_targeted(&rule(None, Some(vec![DeviceClass::Desktop])), &page));
        assert!(is_targeted(&AudienceRule::default(), &page));
    }
}
