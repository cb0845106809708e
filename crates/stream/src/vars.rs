// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Stream variable expansion.
//!
//! Source strings may carry `$stream`, `$basename`, `$wildcard`,
//! `$pluswildcard`, `$source`, `$datetime`, and the individual wall-clock
//! tokens. Expansion substitutes literal values from the current local
//! time and the sanitized name parts; a string without `$` tokens passes
//! through unchanged.

use crate::name::{base_name, wildcard};
use time::OffsetDateTime;

/// Expands all stream variables using the current local wall time.
pub fn expand_variables(template: &str, stream: &str, source: &str) -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    expand_with_time(template, stream, source, now)
}

/// Expansion with an explicit timestamp.
pub fn expand_with_time(
    template: &str,
    stream: &str,
    source: &str,
    now: OffsetDateTime,
) -> String {
    let mut out = template.replace("$source", source);
    // $datetime is shorthand for the dotted component chain, expanded
    // before the components themselves.
    out = out.replace("$datetime", "$year.$month.$day.$hour.$minute.$second");
    out = out.replace("$day", &format!("{:02}", now.day()));
    out = out.replace("$month", &format!("{:02}", u8::from(now.month())));
    out = out.replace("$year", &format!("{:04}", now.year()));
    out = out.replace("$hour", &format!("{:02}", now.hour()));
    out = out.replace("$minute", &format!("{:02}", now.minute()));
    out = out.replace("$second", &format!("{:02}", now.second()));
    out = out.replace("$stream", stream);

    let base = base_name(stream);
    let tail = wildcard(stream).unwrap_or("");
    out = out.replace("$basename", base);
    out = out.replace("$wildcard", tail);
    if tail.is_empty() {
        out.replace("$pluswildcard", "")
    } else {
        out.replace("$pluswildcard", &format!("+{tail}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_name_parts() {
        let t = datetime!(2024-03-07 12:30:45 UTC);
        assert_eq!(
            expand_with_time("s3://$basename/$wildcard/$year-$month-$day.ts", "base+ext", "", t),
            "s3://base/ext/2024-03-07.ts"
        );
    }

    #[test]
    fn test_datetime_chain() {
        let t = datetime!(2024-03-07 12:30:45 UTC);
        assert_eq!(
            expand_with_time("rec-$datetime", "live1", "", t),
            "rec-2024.03.07.12.30.45"
        );
    }

    #[test]
    fn test_stream_and_source() {
        let t = datetime!(2024-01-01 0:00:00 UTC);
        assert_eq!(
            expand_with_time("$stream from $source", "live1", "rtmp://origin", t),
            "live1 from rtmp://origin"
        );
    }

    #[test]
    fn test_pluswildcard_empty_without_tail() {
        let t = datetime!(2024-01-01 0:00:00 UTC);
        assert_eq!(expand_with_time("x$pluswildcard", "solo", "", t), "x");
        assert_eq!(expand_with_time("x$pluswildcard", "base+ext", "", t), "x+ext");
    }

    #[test]
    fn test_idempotent_without_tokens() {
        let t = datetime!(2024-01-01 0:00:00 UTC);
        let plain = "rtmp://host/app/stream.ts";
        let once = expand_with_time(plain, "live1", "src", t);
        assert_eq!(once, plain);
        assert_eq!(expand_with_time(&once, "live1", "src", t), once);
    }
}
