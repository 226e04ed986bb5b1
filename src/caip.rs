// src/caip.rs
// CAIP-style transaction hash references: "{chain-id}:{raw-hash}"

use thiserror::Error;

/// Error parsing a CAIP transaction hash reference.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CaipError {
    #[error("missing ':' separator in tx hash reference {0:?}")]
    MissingSeparator(String),
    #[error("empty chain id in tx hash reference {0:?}")]
    EmptyChainId(String),
    #[error("empty raw hash in tx hash reference {0:?}")]
    EmptyHash(String),
}

/// Format a chain id and raw tx hash into the CAIP reference stored on events.
pub fn format_tx_hash(chain_id: &str, raw_hash: &str) -> String {
    format!("{}:{}", chain_id, raw_hash)
}

/// Split a CAIP tx hash reference into `(chain_id, raw_hash)`.
///
/// Chain ids may themselves contain colons (e.g. `eip155:11155111`), so the
/// split happens on the *last* colon.
pub fn parse_tx_hash(reference: &str) -> Result<(&str, &str), CaipError> {
    let idx = reference
        .rfind(':')
        .ok_or_else(|| CaipError::MissingSeparator(reference.to_string()))?;
    let (chain_id, rest) = reference.split_at(idx);
    let raw_hash = &rest[1..];
    if chain_id.is_empty() {
        return Err(CaipError::EmptyChainId(reference.to_string()));
    }
    if raw_hash.is_empty() {
        return Err(CaipError::EmptyHash(reference.to_string()));
    }
    Ok((chain_id, raw_hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_on_last_colon() {
        let (chain, hash) = parse_tx_hash("eip155:11155111:0xdeadbeef").unwrap();
        assert_eq!(chain, "eip155:11155111");
        assert_eq!(hash, "0xdeadbeef");
    }

    #[test]
    fn parse_simple_chain_id() {
        let (chain, hash) = parse_tx_hash("solana:0xabc").unwrap();
        assert_eq!(chain, "solana");
        assert_eq!(hash, "0xabc");
    }

    #[test]
    fn parse_rejects_missing_separator() {
        assert_eq!(
            parse_tx_hash("nocolon"),
            Err(CaipError::MissingSeparator("nocolon".into()))
        );
    }

    #[test]
    fn parse_rejects_empty_chain_id() {
        assert_eq!(
            parse_tx_hash(":0xabc"),
            Err(CaipError::EmptyChainId(":0xabc".into()))
        );
    }

    #[test]
    fn parse_rejects_empty_hash() {
        assert_eq!(
            parse_tx_hash("eip155:1:"),
            Err(CaipError::EmptyHash("eip155:1:".into()))
        );
    }

    #[test]
    fn format_round_trips() {
        let reference = format_tx_hash("eip155:11155111", "0xabc");
        assert_eq!(parse_tx_hash(&reference).unwrap(), ("eip155:11155111", "0xabc"));
    }
}
