//! Fixed addresses of the system contracts under test, and the rule that
//! re-attributes their storage accesses to the shared backing contract.

use std::collections::HashSet;

use arbdiff_interpret::{remap_addresses, StorageAccess};
use ethers::types::{H160, H256};

/// Logical names for the address-pinned system contracts.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Precompile {
    ArbSys,
    ArbInfo,
    ArbAddressTable,
    ArbAggregator,
    ArbRetryableTx,
    ArbStatistics,
    ArbOwnerPublic,
    ArbGasInfo,
    ArbFunctionTable,
    ArbOwner,
    ArbWasm,
    ArbWasmCache,
}

impl Precompile {
    pub const ALL: [Precompile; 12] = [
        Precompile::ArbSys,
        Precompile::ArbInfo,
        Precompile::ArbAddressTable,
        Precompile::ArbAggregator,
        Precompile::ArbRetryableTx,
        Precompile::ArbStatistics,
        Precompile::ArbOwnerPublic,
        Precompile::ArbGasInfo,
        Precompile::ArbFunctionTable,
        Precompile::ArbOwner,
        Precompile::ArbWasm,
        Precompile::ArbWasmCache,
    ];

    /// The pinned 20-byte address.
    pub fn address(&self) -> H160 {
        match self {
            Precompile::ArbSys => low_address(0x64),
            Precompile::ArbInfo => low_address(0x65),
            Precompile::ArbAddressTable => low_address(0x66),
            Precompile::ArbAggregator => low_address(0x67),
            Precompile::ArbRetryableTx => low_address(0x68),
            Precompile::ArbStatistics => low_address(0x6a),
            Precompile::ArbOwnerPublic => low_address(0x6b),
            Precompile::ArbGasInfo => low_address(0x6c),
            Precompile::ArbFunctionTable => low_address(0x6d),
            Precompile::ArbOwner => low_address(0x70),
            Precompile::ArbWasm => low_address(0x71),
            Precompile::ArbWasmCache => low_address(0x72),
        }
    }

    pub fn from_address(address: H160) -> Option<Precompile> {
        Self::ALL
            .iter()
            .copied()
            .find(|precompile| precompile.address() == address)
    }
}

fn low_address(last_byte: u8) -> H160 {
    let mut bytes = [0u8; 20];
    bytes[19] = last_byte;
    H160(bytes)
}

pub fn is_precompile_address(address: H160) -> bool {
    Precompile::from_address(address).is_some()
}

pub fn precompile_addresses() -> HashSet<H160> {
    Precompile::ALL
        .iter()
        .map(|precompile| precompile.address())
        .collect()
}

/// All precompiles' durable state physically lives in one storage contract
/// at this address on the underlying chain.
pub fn backing_storage_address() -> H160 {
    H160([
        0xa4, 0xb0, 0x5f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff,
    ])
}

/// Slot holding the storage layout version, touched by backing storage
/// updates that the two sides do not perform identically.
pub fn version_slot() -> H256 {
    H256([
        0x15, 0xfe, 0xd0, 0x45, 0x14, 0x99, 0x51, 0x2d, 0x95, 0xf3, 0xec, 0x5a, 0x41, 0xc8, 0x78,
        0xb9, 0xde, 0x55, 0xf2, 0x18, 0x78, 0xb5, 0xb4, 0xe1, 0x90, 0xd4, 0x66, 0x7e, 0xc7, 0x09,
        0xb4, 0x00,
    ])
}

/// Slot holding the stored L2 base fee. The mock reads it when
/// block.basefee is zero during a simulated call; the native side never
/// shows that read in its trace.
pub fn l2_base_fee_slot() -> H256 {
    H256([
        0xe5, 0x4d, 0xe2, 0xa4, 0xcd, 0xac, 0xc0, 0xa0, 0x05, 0x9d, 0x2b, 0x6e, 0x16, 0x34, 0x81,
        0x03, 0xdf, 0x8c, 0x4a, 0xff, 0x40, 0x9c, 0x31, 0xe4, 0x0e, 0xc7, 0x3d, 0x11, 0x92, 0x6c,
        0x82, 0x02,
    ])
}

/// The remapping applied to every parsed access sequence before comparison:
/// accesses attributed to a member address belong to the backing contract.
#[derive(Clone, Debug)]
pub struct RemapRule {
    pub members: HashSet<H160>,
    pub backing: H160,
}

impl RemapRule {
    pub fn standard() -> Self {
        Self {
            members: precompile_addresses(),
            backing: backing_storage_address(),
        }
    }

    pub fn apply(&self, accesses: Vec<StorageAccess>) -> Vec<StorageAccess> {
        remap_addresses(accesses, &self.members, self.backing)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use arbdiff_interpret::AccessKind;

    #[test]
    fn address_table_round_trips() {
        for precompile in Precompile::ALL {
            assert_eq!(Precompile::from_address(precompile.address()), Some(precompile));
        }
    }

    #[test]
    fn owner_precompile_has_expected_address() {
        assert_eq!(
            format!("{:?}", Precompile::ArbOwner.address()),
            "0x0000000000000000000000000000000000000070"
        );
    }

    #[test]
    fn backing_address_is_not_a_member() {
        assert!(!is_precompile_address(backing_storage_address()));
    }

    #[test]
    fn standard_rule_remaps_member_access() {
        let access = StorageAccess {
            address: Precompile::ArbGasInfo.address(),
            slot: version_slot(),
            kind: AccessKind::Read,
            value: None,
            pc: 0,
            op: "SLOAD".to_string(),
        };
        let remapped = RemapRule::standard().apply(vec![access]);
        assert_eq!(remapped[0].address, backing_storage_address());
    }
}
