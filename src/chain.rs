//! Chain configurations selectable from the CLI.

use alloy_chains::Chain as ChainId;

use crate::exec::{Chain, Revision};
use crate::primitives::BlockHeader;
use crate::{DbError, DbResult};

/// The chains the node binary knows how to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainKind {
    EthereumMainnet,
    Devnet,
    Testnet,
    Testnet2,
    Mainnet,
}

impl ChainKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ethereum_mainnet" => Some(Self::EthereumMainnet),
            "devnet" => Some(Self::Devnet),
            "testnet" => Some(Self::Testnet),
            "testnet2" => Some(Self::Testnet2),
            "mainnet" => Some(Self::Mainnet),
            _ => None,
        }
    }

    pub fn spec(self) -> Box<dyn Chain> {
        match self {
            Self::EthereumMainnet => Box::new(EthereumMainnet),
            Self::Devnet => Box::new(FixedRevision {
                id: ChainId::from_id(20143),
                revision: Revision::Cancun,
            }),
            Self::Testnet => Box::new(FixedRevision {
                id: ChainId::from_id(10143),
                revision: Revision::Cancun,
            }),
            Self::Testnet2 => Box::new(FixedRevision {
                id: ChainId::from_id(10144),
                revision: Revision::Cancun,
            }),
            Self::Mainnet => Box::new(FixedRevision {
                id: ChainId::from_id(143),
                revision: Revision::Cancun,
            }),
        }
    }
}

fn validate_common(parent: Option<&BlockHeader>, header: &BlockHeader) -> DbResult<()> {
    if header.gas_used > header.gas_limit {
        return Err(DbError::Validation {
            kind: "gas_used above gas_limit".into(),
        });
    }
    if header.extra_data.len() > 32 {
        return Err(DbError::Validation {
            kind: "extra_data longer than 32 bytes".into(),
        });
    }
    if let Some(parent) = parent {
        if header.number != parent.number + 1 {
            return Err(DbError::Validation {
                kind: "block number not parent + 1".into(),
            });
        }
        if header.parent_hash != parent.hash() {
            return Err(DbError::Validation {
                kind: "parent hash mismatch".into(),
            });
        }
        if header.timestamp <= parent.timestamp {
            return Err(DbError::Validation {
                kind: "timestamp not after parent".into(),
            });
        }
    }
    Ok(())
}

/// Ethereum mainnet fork schedule (block-number activated forks, then the
/// timestamp-activated ones).
#[derive(Debug)]
pub struct EthereumMainnet;

impl Chain for EthereumMainnet {
    fn id(&self) -> ChainId {
        ChainId::mainnet()
    }

    fn revision(&self, block_number: u64, timestamp: u64) -> Revision {
        if timestamp >= 1_710_338_135 {
            Revision::Cancun
        } else if timestamp >= 1_681_338_455 {
            Revision::Shanghai
        } else if block_number >= 12_965_000 {
            Revision::London
        } else if block_number >= 12_244_000 {
            Revision::Berlin
        } else if block_number >= 9_069_000 {
            Revision::Istanbul
        } else if block_number >= 4_370_000 {
            Revision::Byzantium
        } else if block_number >= 2_675_000 {
            Revision::SpuriousDragon
        } else if block_number >= 1_150_000 {
            Revision::Homestead
        } else {
            Revision::Frontier
        }
    }

    fn validate_header(
        &self,
        parent: Option<&BlockHeader>,
        header: &BlockHeader,
    ) -> DbResult<()> {
        validate_common(parent, header)?;
        let revision = self.revision(header.number, header.timestamp);
        if revision >= Revision::London && header.base_fee_per_gas.is_none() {
            return Err(DbError::Validation {
                kind: "missing base fee after london".into(),
            });
        }
        if revision >= Revision::Shanghai && header.withdrawals_root.is_none() {
            return Err(DbError::Validation {
                kind: "missing withdrawals root after shanghai".into(),
            });
        }
        Ok(())
    }
}

/// Dev and test chains run a single revision from genesis.
#[derive(Debug)]
struct FixedRevision {
    id: ChainId,
    revision: Revision,
}

impl Chain for FixedRevision {
    fn id(&self) -> ChainId {
        self.id
    }

    fn revision(&self, _block_number: u64, _timestamp: u64) -> Revision {
        self.revision
    }

    fn validate_header(
        &self,
        parent: Option<&BlockHeader>,
        header: &BlockHeader,
    ) -> DbResult<()> {
        validate_common(parent, header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_schedule() {
        let chain = EthereumMainnet;
        assert_eq!(chain.revision(0, 0), Revision::Frontier);
        assert_eq!(chain.revision(4_370_000, 0), Revision::Byzantium);
        assert_eq!(chain.revision(12_965_000, 0), Revision::London);
        assert_eq!(chain.revision(17_000_000, 1_681_338_455), Revision::Shanghai);
        assert_eq!(chain.revision(19_400_000, 1_710_338_135), Revision::Cancun);
    }

    #[test]
    fn header_validation_rejects_bad_parent_link() {
        let chain = EthereumMainnet;
        let parent = BlockHeader {
            number: 9,
            timestamp: 100,
            ..Default::default()
        };
        let mut header = BlockHeader {
            number: 11,
            timestamp: 112,
            ..Default::default()
        };
        assert!(chain.validate_header(Some(&parent), &header).is_err());
        header.number = 10;
        header.parent_hash = parent.hash();
        // Frontier-era header with no base fee passes.
        chain.validate_header(Some(&parent), &header).unwrap();
    }
}
