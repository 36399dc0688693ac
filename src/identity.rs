//! Deterministic caller identities shared by both backends.
//!
//! Wallets derive from one fixed mnemonic so that identity N resolves to
//! the same address against either node. Index 5 is the privileged chain
//! owner, index 6 an ordinary account.

use ethers::signers::{coins_bip39::English, LocalWallet, MnemonicBuilder, Signer, WalletError};
use ethers::types::H160;
use thiserror::Error;

const TEST_MNEMONIC: &str =
    "indoor dish desk flag debris potato excuse depart ticket judge file exit";
const DERIVATION_PREFIX: &str = "m/44'/60'/0'/0/";
const POOL_SIZE: usize = 11;
const OWNER_INDEX: usize = 5;
const PLAIN_INDEX: usize = 6;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Wallet error {0}")]
    Wallet(#[from] WalletError),
    #[error("Address {0:?} is not in the identity pool")]
    UnknownAddress(H160),
    #[error("Identity index {index} outside pool of {size}")]
    IndexOutOfRange { index: usize, size: usize },
}

/// The fixed pool of caller identities. Read-only after construction.
#[derive(Clone, Debug)]
pub struct IdentityPool {
    addresses: Vec<H160>,
}

impl IdentityPool {
    pub fn new() -> Result<Self, IdentityError> {
        let mut addresses = Vec::with_capacity(POOL_SIZE);
        for index in 0..POOL_SIZE {
            addresses.push(derive_wallet(index)?.address());
        }
        Ok(Self { addresses })
    }

    /// Signer for the identity at `index`, usable against either backend.
    pub fn wallet(&self, index: usize) -> Result<LocalWallet, IdentityError> {
        if index >= self.addresses.len() {
            return Err(IdentityError::IndexOutOfRange {
                index,
                size: self.addresses.len(),
            });
        }
        derive_wallet(index)
    }

    pub fn owner(&self) -> Result<LocalWallet, IdentityError> {
        self.wallet(OWNER_INDEX)
    }

    pub fn plain(&self) -> Result<LocalWallet, IdentityError> {
        self.wallet(PLAIN_INDEX)
    }

    pub fn owner_address(&self) -> H160 {
        self.addresses[OWNER_INDEX]
    }

    pub fn plain_address(&self) -> H160 {
        self.addresses[PLAIN_INDEX]
    }

    /// Reverse-maps an observed address back to its pool index.
    pub fn index_of(&self, address: H160) -> Option<usize> {
        self.addresses.iter().position(|known| *known == address)
    }

    /// Every transaction sender must be pooled; unknown senders are fatal.
    pub fn require_index(&self, address: H160) -> Result<usize, IdentityError> {
        self.index_of(address)
            .ok_or(IdentityError::UnknownAddress(address))
    }
}

fn derive_wallet(index: usize) -> Result<LocalWallet, IdentityError> {
    let path = format!("{DERIVATION_PREFIX}{index}");
    Ok(MnemonicBuilder::<English>::default()
        .phrase(TEST_MNEMONIC)
        .derivation_path(&path)?
        .build()?)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let first = IdentityPool::new().unwrap();
        let second = IdentityPool::new().unwrap();
        assert_eq!(first.owner_address(), second.owner_address());
        assert_eq!(
            first.wallet(0).unwrap().address(),
            second.wallet(0).unwrap().address()
        );
    }

    #[test]
    fn wallet_addresses_match_pool_addresses() {
        let pool = IdentityPool::new().unwrap();
        for index in 0..POOL_SIZE {
            let wallet = pool.wallet(index).unwrap();
            assert_eq!(pool.index_of(wallet.address()), Some(index));
        }
    }

    #[test]
    fn owner_and_plain_identities_differ() {
        let pool = IdentityPool::new().unwrap();
        assert_ne!(pool.owner_address(), pool.plain_address());
        assert_eq!(pool.index_of(pool.owner_address()), Some(OWNER_INDEX));
        assert_eq!(pool.index_of(pool.plain_address()), Some(PLAIN_INDEX));
    }

    #[test]
    fn unknown_address_is_rejected() {
        let pool = IdentityPool::new().unwrap();
        let unknown = H160::repeat_byte(0x77);
        assert!(pool.index_of(unknown).is_none());
        assert!(matches!(
            pool.require_index(unknown),
            Err(IdentityError::UnknownAddress(_))
        ));
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let pool = IdentityPool::new().unwrap();
        assert!(matches!(
            pool.wallet(POOL_SIZE),
            Err(IdentityError::IndexOutOfRange { .. })
        ));
    }
}
