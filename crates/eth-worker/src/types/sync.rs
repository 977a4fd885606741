use super::Timestamp;
use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Internal, monotonically assigned filter id.
pub type FilterId = u64;

/// Event family a filter watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterKind {
    /// ERC20 `Transfer(address,address,uint256)`.
    Transfer,
}

/// A contract whose transfer logs are mirrored to the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFilter {
    pub id: FilterId,
    pub contract_address: Address,
    /// Optional `{"from": [...], "to": [...]}` address lists.
    pub filter_parameters: Option<Value>,
    pub kind: FilterKind,
    pub decimals: u8,
    /// First block to scan when nothing has been synchronised yet.
    pub start_block: Option<u64>,
    /// Last fully synchronised block. Only moves forward.
    pub max_block: Option<u64>,
    pub created_at: Timestamp,
}

impl SyncFilter {
    /// Whether this filter watches the same logs as the given parameters.
    pub fn is_equivalent(
        &self,
        contract_address: &Address,
        filter_parameters: &Option<Value>,
        kind: FilterKind,
    ) -> bool {
        self.contract_address == *contract_address
            && self.kind == kind
            && normalized(&self.filter_parameters) == normalized(filter_parameters)
    }
}

fn normalized(params: &Option<Value>) -> Option<&Value> {
    params
        .as_ref()
        .filter(|v| !v.is_null() && v.as_object().map_or(true, |o| !o.is_empty()))
}

/// Progress of one block chunk of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockRangeStatus {
    Pending,
    Success,
}

/// A scanned (or partially scanned) block chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynchronizedBlock {
    pub filter_id: FilterId,
    pub from_block: u64,
    pub to_block: u64,
    pub status: BlockRangeStatus,
    pub attempts: u32,
    pub updated_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter(params: Option<Value>) -> SyncFilter {
        SyncFilter {
            id: 1,
            contract_address: Address::repeat_byte(0x11),
            filter_parameters: params,
            kind: FilterKind::Transfer,
            decimals: 18,
            start_block: None,
            max_block: None,
            created_at: 0,
        }
    }

    #[test]
    fn test_equivalence_ignores_key_order_and_empty_params() {
        let addr = Address::repeat_byte(0x11);
        let f = filter(Some(json!({"from": ["0x01"], "to": ["0x02"]})));
        assert!(f.is_equivalent(
            &addr,
            &Some(json!({"to": ["0x02"], "from": ["0x01"]})),
            FilterKind::Transfer
        ));
        assert!(!f.is_equivalent(&addr, &None, FilterKind::Transfer));

        let empty = filter(Some(json!({})));
        assert!(empty.is_equivalent(&addr, &None, FilterKind::Transfer));
        assert!(!empty.is_equivalent(&Address::ZERO, &None, FilterKind::Transfer));
    }
}
