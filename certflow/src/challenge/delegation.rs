/// Rewrite a challenge record name according to `;`-separated `source:target` rules.
///
/// `*.a:*.b` keeps the labels below `a` and moves them under `b`; `*.a:b` sends every name
/// under `a` to the single record `b`; `a:b` applies to `a` itself only. A wildcard source
/// also covers the bare domain. The first matching rule wins; no match returns the name
/// unchanged. The leading label of the record (`_acme-challenge`) is always preserved.
pub fn apply_delegation_rule(record_name: &str, rules: Option<&str>) -> String {
    let Some(rules) = rules.filter(|r| !r.trim().is_empty()) else {
        return record_name.to_string();
    };
    let Some((label, domain)) = record_name.split_once('.') else {
        return record_name.to_string();
    };
    let domain = domain.to_lowercase();

    for rule in rules.split(';') {
        let Some((source, target)) = rule.split_once(':') else {
            continue;
        };
        let source = source.trim().to_lowercase();
        let target = target.trim().to_lowercase();
        if source.is_empty() || target.is_empty() {
            continue;
        }
        match source.strip_prefix("*.") {
            Some(base) => {
                let prefix = if domain == base {
                    ""
                } else if let Some(prefix) = domain.strip_suffix(&format!(".{base}")) {
                    prefix
                } else {
                    continue;
                };
                return match target.strip_prefix("*.") {
                    Some(target_base) if prefix.is_empty() => format!("{label}.{target_base}"),
                    Some(target_base) => format!("{label}.{prefix}.{target_base}"),
                    None => format!("{label}.{target}"),
                };
            }
            None if domain == source => {
                return format!("{label}.{}", target.trim_start_matches("*."));
            }
            None => {}
        }
    }
    record_name.to_string()
}
