//! Reward label parsing.
//!
//! A bounty label is `$N`, optionally preceded by the word `bounty` (any case,
//! optionally followed by `:`). `N` is a whole-dollar amount and may use `,` as a
//! thousands separator. Amounts are returned in cents.

/// Parses a single label into a reward amount in cents. Returns `None` for
/// anything that is not a bounty label, including zero amounts.
pub fn parse_bounty_label(label: &str) -> Option<u64> {
    let mut rest = label.trim();

    if rest.len() >= 6 && rest.is_char_boundary(6) && rest[..6].eq_ignore_ascii_case("bounty") {
        rest = rest[6..].trim_start();
        if let Some(stripped) = rest.strip_prefix(':') {
            rest = stripped.trim_start();
        }
    }

    let digits = rest.strip_prefix('$')?;
    let dollars = parse_dollars(digits)?;
    if dollars == 0 {
        return None;
    }
    dollars.checked_mul(100)
}

/// Returns the reward of the first bounty label in `labels`.
pub fn reward_from_labels<I, S>(labels: I) -> Option<u64>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    labels
        .into_iter()
        .find_map(|label| parse_bounty_label(label.as_ref()))
}

fn parse_dollars(s: &str) -> Option<u64> {
    if s.is_empty() {
        return None;
    }

    let mut groups = s.split(',');
    let first = groups.next()?;
    let grouped = s.contains(',');

    if !is_digits(first) || (grouped && first.len() > 3) {
        return None;
    }

    let mut value: u64 = first.parse().ok()?;
    for group in groups {
        if group.len() != 3 || !is_digits(group) {
            return None;
        }
        value = value
            .checked_mul(1000)?
            .checked_add(group.parse::<u64>().ok()?)?;
    }
    Some(value)
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
