// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Interface addresses from Junos-style router configuration.
//!
//! Only `interfaces { <if> { unit <n> { family inet|inet6 { address <a>/<len>; } } } }`
//! is interpreted; every other block is skipped.

use std::net::IpAddr;

use thiserror::Error;

/// One configured interface address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    /// Interface name, e.g. `xe-0/0/1`.
    pub interface: String,
    /// Logical unit number.
    pub unit: u32,
    /// Address assigned to the unit.
    pub address: IpAddr,
    /// Prefix length of the attached network.
    pub prefix_len: u8,
}

/// Router configuration could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigParseError {
    /// `}` without a matching `{`, or input ended inside a block.
    #[error("unbalanced braces at line {line}")]
    Unbalanced {
        /// 1-based line number.
        line: usize,
    },
    /// An `address` statement that is not `ip/len`.
    #[error("bad address `{text}` at line {line}")]
    BadAddress {
        /// 1-based line number.
        line: usize,
        /// Offending token.
        text: String,
    },
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Open,
    Close,
    End,
}

fn tokenize(text: &str) -> Vec<(usize, Token)> {
    let mut tokens = Vec::new();
    let mut in_comment = false;
    for (n, raw) in text.lines().enumerate() {
        let line = n + 1;
        let mut rest = raw;
        loop {
            if in_comment {
                match rest.find("*/") {
                    Some(end) => {
                        rest = &rest[end + 2..];
                        in_comment = false;
                    }
                    None => break,
                }
            }
            let Some(start) = rest.find(|c: char| !c.is_whitespace()) else {
                break;
            };
            rest = &rest[start..];
            if rest.starts_with('#') {
                break;
            }
            if let Some(after) = rest.strip_prefix("/*") {
                rest = after;
                in_comment = true;
                continue;
            }
            let (token, len) = match rest.chars().next() {
                Some('{') => (Token::Open, 1),
                Some('}') => (Token::Close, 1),
                Some(';') => (Token::End, 1),
                Some('"') => {
                    let body = &rest[1..];
                    let end = body.find('"').unwrap_or(body.len());
                    (Token::Word(body[..end].to_string()), (end + 2).min(rest.len()))
                }
                _ => {
                    let end = rest
                        .find(|c: char| c.is_whitespace() || matches!(c, '{' | '}' | ';'))
                        .unwrap_or(rest.len());
                    (Token::Word(rest[..end].to_string()), end)
                }
            };
            tokens.push((line, token));
            rest = &rest[len..];
        }
    }
    tokens
}

fn parse_address(line: usize, text: &str) -> Result<(IpAddr, u8), ConfigParseError> {
    let bad = || ConfigParseError::BadAddress {
        line,
        text: text.to_string(),
    };
    let (ip, len) = text.split_once('/').ok_or_else(bad)?;
    let address: IpAddr = ip.parse().map_err(|_| bad())?;
    let prefix_len: u8 = len.parse().map_err(|_| bad())?;
    let max = if address.is_ipv4() { 32 } else { 128 };
    if prefix_len > max {
        return Err(bad());
    }
    Ok((address, prefix_len))
}

/// Where a statement sits, reduced to what address extraction needs.
fn context(stack: &[Vec<String>]) -> Option<(String, u32)> {
    let mut frames = stack.iter();
    frames.find(|f| f.first().map(String::as_str) == Some("interfaces"))?;
    let interface = frames.next()?.first()?.clone();
    let unit = frames.next()?;
    if unit.first().map(String::as_str) != Some("unit") {
        return None;
    }
    let unit: u32 = unit.get(1)?.parse().ok()?;
    let family = frames.next()?;
    let inet = family.first().map(String::as_str) == Some("family")
        && matches!(family.get(1).map(String::as_str), Some("inet" | "inet6"));
    if !inet || frames.next().is_some() {
        return None;
    }
    Some((interface, unit))
}

/// Extract every interface address from a configuration text.
///
/// ```
/// use nre_paths::parse_router_config;
///
/// let text = "interfaces { xe-0/0/1 { unit 0 { family inet { address 10.0.0.1/30; } } } }";
/// let found = parse_router_config(text).unwrap();
/// assert_eq!(found[0].address.to_string(), "10.0.0.1");
/// assert_eq!(found[0].prefix_len, 30);
/// ```
pub fn parse_router_config(text: &str) -> Result<Vec<InterfaceAddress>, ConfigParseError> {
    let mut out = Vec::new();
    let mut stack: Vec<Vec<String>> = Vec::new();
    let mut words: Vec<String> = Vec::new();
    let mut last_line = 0;
    for (line, token) in tokenize(text) {
        last_line = line;
        match token {
            Token::Word(w) => words.push(w),
            Token::Open => {
                // `address a/len { primary; }` still assigns the address.
                if words.first().map(String::as_str) == Some("address") {
                    emit(&stack, &words, line, &mut out)?;
                }
                stack.push(std::mem::take(&mut words));
            }
            Token::End => {
                if words.first().map(String::as_str) == Some("address") {
                    emit(&stack, &words, line, &mut out)?;
                }
                words.clear();
            }
            Token::Close => {
                if stack.pop().is_none() {
                    return Err(ConfigParseError::Unbalanced { line });
                }
                words.clear();
            }
        }
    }
    if !stack.is_empty() {
        return Err(ConfigParseError::Unbalanced { line: last_line });
    }
    Ok(out)
}

fn emit(
    stack: &[Vec<String>],
    words: &[String],
    line: usize,
    out: &mut Vec<InterfaceAddress>,
) -> Result<(), ConfigParseError> {
    let Some((interface, unit)) = context(stack) else {
        return Ok(());
    };
    let Some(text) = words.get(1) else {
        return Err(ConfigParseError::BadAddress {
            line,
            text: String::new(),
        });
    };
    let (address, prefix_len) = parse_address(line, text)?;
    out.push(InterfaceAddress {
        interface,
        unit,
        address,
        prefix_len,
    });
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
/* managed by ops */
system { host-name r1; }
interfaces {
    xe-0/0/1 {
        description "to r2";
        unit 0 {
            family inet {
                address 10.0.0.1/30;
            }
            family iso;
        }
    }
    lo0 {
        unit 0 {
            family inet {
                address 192.0.2.1/32 {
                    primary;
                }
            }
            family inet6 {
                address 2001:db8::1/128;
            }
        }
    }
}
protocols { ospf { area 0.0.0.0 { interface xe-0/0/1.0; } } }
"#;

    #[test]
    fn addresses_are_extracted_with_their_interface() {
        let found = parse_router_config(SAMPLE).unwrap();
        let summary: Vec<(String, u32, String, u8)> = found
            .iter()
            .map(|a| (a.interface.clone(), a.unit, a.address.to_string(), a.prefix_len))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("xe-0/0/1".to_string(), 0, "10.0.0.1".to_string(), 30),
                ("lo0".to_string(), 0, "192.0.2.1".to_string(), 32),
                ("lo0".to_string(), 0, "2001:db8::1".to_string(), 128),
            ]
        );
    }

    #[test]
    fn malformed_input_is_reported() {
        assert_eq!(
            parse_router_config("interfaces { }\n}"),
            Err(ConfigParseError::Unbalanced { line: 2 })
        );
        assert!(matches!(
            parse_router_config("interfaces { e { unit 0 { family inet { address 10.0.0.1; } } } }"),
            Err(ConfigParseError::BadAddress { .. })
        ));
        assert!(parse_router_config("interfaces {").is_err());
    }
}
