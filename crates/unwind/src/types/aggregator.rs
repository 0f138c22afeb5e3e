use alloy::primitives::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What the orchestration loop asks an aggregator to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRequest {
    pub token_in: Address,
    pub token_out: Address,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount_in: Decimal,
    /// Receiver of the swap output (the strategy).
    pub beneficiary: Address,
}

/// Executable swap instructions returned by an aggregator.
///
/// Injected into the step as a parameter; the step never calls back into the
/// aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapFill {
    /// Provider name: "1inch", "openocean", "paper".
    pub provider: String,
    /// Router contract that executes `calldata`.
    pub aggregator: Address,
    pub token_in: Address,
    pub token_out: Address,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount_in: Decimal,
    /// Output amount the provider declared for this route.
    #[serde(with = "rust_decimal::serde::str")]
    pub amount_out_expected: Decimal,
    #[serde(with = "hex_bytes")]
    pub calldata: Vec<u8>,
}

/// Hex-encode/decode Vec<u8> for JSON serialization.
mod hex_bytes {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let hex_string = format!("0x{}", hex::encode(bytes));
        serializer.serialize_str(&hex_string)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use rust_decimal_macros::dec;

    #[test]
    fn test_calldata_serialized_as_hex() {
        let fill = SwapFill {
            provider: "paper".into(),
            aggregator: address!("111111125421cA6dc452d289314280a0f8842A65"),
            token_in: address!("0000000000000000000000000000000000000001"),
            token_out: address!("0000000000000000000000000000000000000002"),
            amount_in: dec!(10),
            amount_out_expected: dec!(9.9),
            calldata: vec![0xde, 0xad],
        };
        let json = serde_json::to_value(&fill).unwrap();
        assert_eq!(json["calldata"], "0xdead");
        assert_eq!(json["amount_out_expected"], "9.9");
        let back: SwapFill = serde_json::from_value(json).unwrap();
        assert_eq!(back, fill);
    }
}
