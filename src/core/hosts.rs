//! Hosts-file editing for local sites.
//!
//! Pure text transforms; reading and writing the file goes through an
//! execution backend because it needs elevated privileges.

pub const LOOPBACK: &str = "127.0.0.1";

/// Host names on one line, comments and the address column excluded.
fn host_tokens(line: &str) -> impl Iterator<Item = &str> {
    let content = line.split('#').next().unwrap_or("");
    content.split_whitespace().skip(1)
}

pub fn contains(contents: &str, domain: &str) -> bool {
    contents
        .lines()
        .any(|line| host_tokens(line).any(|host| host.eq_ignore_ascii_case(domain)))
}

/// Contents with `address<TAB>domain` appended, or `None` if the domain is
/// already mapped.
pub fn with_entry(contents: &str, address: &str, domain: &str) -> Option<String> {
    if contains(contents, domain) {
        return None;
    }
    let mut updated = contents.to_string();
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&format!("{}\t{}\n", address, domain));
    Some(updated)
}

/// Contents without any line mapping `domain`, or `None` if nothing matched.
pub fn without_entry(contents: &str, domain: &str) -> Option<String> {
    if !contains(contents, domain) {
        return None;
    }
    let mut updated: String = contents
        .lines()
        .filter(|line| !host_tokens(line).any(|host| host.eq_ignore_ascii_case(domain)))
        .collect::<Vec<_>>()
        .join("\n");
    updated.push('\n');
    Some(updated)
}
