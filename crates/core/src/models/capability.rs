//! Contract capability set and derived contract type.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A standard interface a contract can be detected to implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Capability {
    Erc1155 = 0,
    Erc1155TokenReceiver = 1,
    Erc777 = 2,
    Erc165 = 3,
    Erc721 = 4,
    Erc721Metadata = 5,
    Erc721Enumerable = 6,
    Erc20 = 7,
    Erc20Detailed = 8,
    Erc20Burnable = 9,
    Erc20Mintable = 10,
    Erc20Pausable = 11,
    Erc20Capped = 12,
}

impl Capability {
    /// Every capability, in bit order.
    pub const ALL: [Capability; 13] = [
        Capability::Erc1155,
        Capability::Erc1155TokenReceiver,
        Capability::Erc777,
        Capability::Erc165,
        Capability::Erc721,
        Capability::Erc721Metadata,
        Capability::Erc721Enumerable,
        Capability::Erc20,
        Capability::Erc20Detailed,
        Capability::Erc20Burnable,
        Capability::Erc20Mintable,
        Capability::Erc20Pausable,
        Capability::Erc20Capped,
    ];

    /// Upper-case name, e.g. `ERC20_DETAILED`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Erc1155 => "ERC1155",
            Self::Erc1155TokenReceiver => "ERC1155_TOKEN_RECEIVER",
            Self::Erc777 => "ERC777",
            Self::Erc165 => "ERC165",
            Self::Erc721 => "ERC721",
            Self::Erc721Metadata => "ERC721_METADATA",
            Self::Erc721Enumerable => "ERC721_ENUMERABLE",
            Self::Erc20 => "ERC20",
            Self::Erc20Detailed => "ERC20_DETAILED",
            Self::Erc20Burnable => "ERC20_BURNABLE",
            Self::Erc20Mintable => "ERC20_MINTABLE",
            Self::Erc20Pausable => "ERC20_PAUSABLE",
            Self::Erc20Capped => "ERC20_CAPPED",
        }
    }

    const fn bit(self) -> u16 {
        1 << self as u8
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bitset over [`Capability`].
///
/// The empty set is a real answer ("no recognized interface"), not "unknown".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractCapabilities(u16);

impl ContractCapabilities {
    const MASK: u16 = (1 << Capability::ALL.len()) - 1;

    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Rebuild from stored bits; unknown bits are dropped.
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits & Self::MASK)
    }

    /// Raw bits for storage.
    pub const fn bits(self) -> u16 {
        self.0
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0 |= capability.bit();
    }

    pub fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether Transfer logs from this contract carry token ids.
    pub fn is_non_fungible(self) -> bool {
        self.contains(Capability::Erc721) || self.contains(Capability::Erc1155)
    }

    /// Members in bit order.
    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |c| self.contains(*c))
    }

    /// Most specific token standard implemented.
    pub fn contract_type(self) -> ContractType {
        if self.contains(Capability::Erc777) {
            ContractType::Erc777
        } else if self.contains(Capability::Erc1155) {
            ContractType::Erc1155
        } else if self.contains(Capability::Erc721) {
            ContractType::Erc721
        } else if self.contains(Capability::Erc20) {
            ContractType::Erc20
        } else {
            ContractType::Generic
        }
    }
}

impl FromIterator<Capability> for ContractCapabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = Self::empty();
        for capability in iter {
            set.insert(capability);
        }
        set
    }
}

impl fmt::Display for ContractCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, capability) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(capability.as_str())?;
        }
        f.write_str("}")
    }
}

/// Token standard a contract is indexed as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractType {
    Erc1155,
    Erc777,
    Erc721,
    Erc20,
    #[default]
    Generic,
}

impl ContractType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Erc1155 => "erc1155",
            Self::Erc777 => "erc777",
            Self::Erc721 => "erc721",
            Self::Erc20 => "erc20",
            Self::Generic => "generic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "erc1155" => Some(Self::Erc1155),
            "erc777" => Some(Self::Erc777),
            "erc721" => Some(Self::Erc721),
            "erc20" => Some(Self::Erc20),
            "generic" => Some(Self::Generic),
            _ => None,
        }
    }
}
