// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Offset-based pagination.
//!
//! The offset into the full ordered result set is encoded in base-36 and
//! returned as `NextToken`. Large offsets and restart-stability under
//! concurrent mutation are deliberately unaddressed — this mirrors the
//! single-process, single-mutex model rather than inventing a stronger
//! contract.

use crate::error::{Error, Result};

pub fn encode_token(offset: usize) -> String {
    to_base36(offset as u128)
}

pub fn decode_token(token: &str) -> Result<usize> {
    from_base36(token)
        .map(|v| v as usize)
        .ok_or_else(|| Error::InvalidParameterValue(format!("unparseable NextToken: {token}")))
}

/// Slices `items` starting at `next_token` (default 0), taking at most
/// `max_results` (default: everything), and returns the page plus a
/// `NextToken` for the remainder, if any.
pub fn paginate<T: Clone>(
    items: &[T],
    max_results: Option<u32>,
    next_token: Option<&str>,
) -> Result<(Vec<T>, Option<String>)> {
    let offset = match next_token {
        Some(t) => decode_token(t)?,
        None => 0,
    };
    if offset > items.len() {
        return Ok((Vec::new(), None));
    }
    let remaining = &items[offset..];
    let take = max_results.map(|n| n as usize).unwrap_or(remaining.len());
    let page: Vec<T> = remaining.iter().take(take).cloned().collect();
    let next = if take < remaining.len() {
        Some(encode_token(offset + take))
    } else {
        None
    };
    Ok((page, next))
}

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn to_base36(mut n: u128) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).expect("base36 alphabet is ASCII")
}

fn from_base36(s: &str) -> Option<u128> {
    if s.is_empty() {
        return None;
    }
    let mut value: u128 = 0;
    for c in s.chars() {
        let digit = c.to_digit(36)?;
        value = value.checked_mul(36)?.checked_add(digit as u128)?;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for offset in [0usize, 1, 35, 36, 1000, 999_999] {
            let token = encode_token(offset);
            assert_eq!(decode_token(&token).unwrap(), offset);
        }
    }

    #[test]
    fn unparseable_token_is_invalid_parameter() {
        let err = decode_token("!!!").unwrap_err();
        assert_eq!(err.code(), "InvalidParameterValue");
    }

    #[test]
    fn pages_partition_with_no_overlap_or_gaps() {
        let items: Vec<u32> = (0..10).collect();
        let mut seen = Vec::new();
        let mut token = None;
        loop {
            let (page, next) = paginate(&items, Some(3), token.as_deref()).unwrap();
            seen.extend(page);
            match next {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        assert_eq!(seen, items);
    }
}
