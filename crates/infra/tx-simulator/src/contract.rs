//! SimpleStorage contract ABI bindings and bytecode.

use alloy_primitives::{Bytes, U256};
use alloy_sol_types::SolCall;
use eyre::{Result, WrapErr};

alloy_sol_macro::sol! {
    interface SimpleStorage {
        function set(uint256 _value) external;
        function get() external view returns (uint256);
    }
}

const SIMPLE_STORAGE_BYTECODE_HEX: &str = include_str!("simple_storage_bytecode.hex");

/// Returns the SimpleStorage creation bytecode.
pub fn simple_storage_bytecode() -> Result<Bytes> {
    let bytecode = hex::decode(SIMPLE_STORAGE_BYTECODE_HEX.trim().trim_start_matches("0x"))
        .wrap_err("invalid SimpleStorage bytecode hex")?;
    Ok(bytecode.into())
}

/// Encodes a call to `SimpleStorage.set(value)`.
pub fn encode_set_call(value: U256) -> Bytes {
    SimpleStorage::setCall { _value: value }.abi_encode().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytecode_decodes() {
        let bytecode = simple_storage_bytecode().unwrap();
        // PUSH1 0x80 PUSH1 0x40 MSTORE
        assert_eq!(&bytecode[..5], &[0x60, 0x80, 0x60, 0x40, 0x52]);
    }

    #[test]
    fn test_set_call_encoding() {
        let data = encode_set_call(U256::from(42));
        assert_eq!(data.len(), 36);
        assert_eq!(&data[..4], &[0x60, 0xfe, 0x47, 0xb1]);
        assert_eq!(U256::from_be_slice(&data[4..]), U256::from(42));
    }
}
