use std::collections::HashSet;

/// Split a comma-separated address string, trimming entries and dropping
/// empties. `""` and `None`-ish inputs yield an empty list.
pub fn parse_address_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Merge form-level CC/BCC with a sender account's defaults.
///
/// Within each list the first occurrence wins and relative order is
/// preserved, with form entries ahead of account defaults.
pub fn merge_address_lists(
    form_cc: &str,
    form_bcc: &str,
    default_cc: &str,
    default_bcc: &str,
) -> (Vec<String>, Vec<String>) {
    let cc = ordered_unique(
        parse_address_list(form_cc)
            .into_iter()
            .chain(parse_address_list(default_cc)),
    );
    let bcc = ordered_unique(
        parse_address_list(form_bcc)
            .into_iter()
            .chain(parse_address_list(default_bcc)),
    );

    (cc, bcc)
}

fn ordered_unique(entries: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    entries.filter(|entry| seen.insert(entry.clone())).collect()
}
