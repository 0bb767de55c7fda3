//! Capability detector.
//!
//! Static classification of deployed bytecode against the token standards.
//! Solidity dispatchers compare the call's selector against `PUSH4 <selector>`
//! constants (`PUSH1..PUSH3` when the selector has leading zero bytes), so
//! the detector walks the opcode stream, collects those immediates and
//! checks each interface's required selector set. Nothing is executed.
//!
//! A selector hidden by the compiler (inlined, computed, proxied) reads as
//! absent. Unrecognized bytecode yields the empty set.

use std::collections::HashSet;
use std::num::NonZeroUsize;

use alloy_primitives::{B256, keccak256};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use crate::metrics::record_capability_cache;
use crate::models::{Capability, ContractCapabilities};

// =============================================================================
// Selectors
// =============================================================================

mod selectors {
    // ERC20
    pub const TOTAL_SUPPLY: [u8; 4] = [0x18, 0x16, 0x0d, 0xdd];
    pub const BALANCE_OF: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];
    pub const TRANSFER: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];
    pub const ALLOWANCE: [u8; 4] = [0xdd, 0x62, 0xed, 0x3e];
    pub const APPROVE: [u8; 4] = [0x09, 0x5e, 0xa7, 0xb3];
    pub const TRANSFER_FROM: [u8; 4] = [0x23, 0xb8, 0x72, 0xdd];
    pub const NAME: [u8; 4] = [0x06, 0xfd, 0xde, 0x03];
    pub const SYMBOL: [u8; 4] = [0x95, 0xd8, 0x9b, 0x41];
    pub const DECIMALS: [u8; 4] = [0x31, 0x3c, 0xe5, 0x67];
    pub const BURN: [u8; 4] = [0x42, 0x96, 0x6c, 0x68];
    pub const BURN_FROM: [u8; 4] = [0x79, 0xcc, 0x67, 0x90];
    pub const MINT: [u8; 4] = [0x40, 0xc1, 0x0f, 0x19];
    pub const PAUSE: [u8; 4] = [0x84, 0x56, 0xcb, 0x59];
    pub const UNPAUSE: [u8; 4] = [0x3f, 0x4b, 0xa8, 0x3a];
    pub const CAP: [u8; 4] = [0x35, 0x52, 0x74, 0xea];

    // ERC165
    pub const SUPPORTS_INTERFACE: [u8; 4] = [0x01, 0xff, 0xc9, 0xa7];

    // ERC721
    pub const OWNER_OF: [u8; 4] = [0x63, 0x52, 0x21, 0x1e];
    pub const SAFE_TRANSFER_FROM: [u8; 4] = [0x42, 0x84, 0x2e, 0x0e];
    pub const SAFE_TRANSFER_FROM_DATA: [u8; 4] = [0xb8, 0x8d, 0x4f, 0xde];
    pub const SET_APPROVAL_FOR_ALL: [u8; 4] = [0xa2, 0x2c, 0xb4, 0x65];
    pub const GET_APPROVED: [u8; 4] = [0x08, 0x18, 0x12, 0xfc];
    pub const IS_APPROVED_FOR_ALL: [u8; 4] = [0xe9, 0x85, 0xe9, 0xc5];
    pub const TOKEN_URI: [u8; 4] = [0xc8, 0x7b, 0x56, 0xdd];
    pub const TOKEN_OF_OWNER_BY_INDEX: [u8; 4] = [0x2f, 0x74, 0x5c, 0x59];
    pub const TOKEN_BY_INDEX: [u8; 4] = [0x4f, 0x6c, 0xcc, 0xe7];

    // ERC1155
    pub const SAFE_TRANSFER_FROM_1155: [u8; 4] = [0xf2, 0x42, 0x43, 0x2a];
    pub const SAFE_BATCH_TRANSFER_FROM: [u8; 4] = [0x2e, 0xb2, 0xc2, 0xd6];
    pub const BALANCE_OF_1155: [u8; 4] = [0x00, 0xfd, 0xd5, 0x8e];
    pub const BALANCE_OF_BATCH: [u8; 4] = [0x4e, 0x12, 0x73, 0xf4];
    pub const ON_ERC1155_RECEIVED: [u8; 4] = [0xf2, 0x3a, 0x6e, 0x61];
    pub const ON_ERC1155_BATCH_RECEIVED: [u8; 4] = [0xbc, 0x19, 0x7c, 0x81];

    // ERC777
    pub const GRANULARITY: [u8; 4] = [0x55, 0x6f, 0x0d, 0xc7];
    pub const SEND: [u8; 4] = [0x9b, 0xd9, 0xbb, 0xc6];
    pub const BURN_777: [u8; 4] = [0xfe, 0x9d, 0x93, 0x03];
    pub const IS_OPERATOR_FOR: [u8; 4] = [0xd9, 0x5b, 0x63, 0x71];
    pub const AUTHORIZE_OPERATOR: [u8; 4] = [0x95, 0x9b, 0x8c, 0x3f];
    pub const REVOKE_OPERATOR: [u8; 4] = [0xfa, 0xd8, 0xb3, 0x2a];
    pub const DEFAULT_OPERATORS: [u8; 4] = [0x06, 0xe4, 0x85, 0x38];
    pub const OPERATOR_SEND: [u8; 4] = [0x62, 0xad, 0x1b, 0x83];
    pub const OPERATOR_BURN: [u8; 4] = [0xfc, 0x67, 0x3c, 0x4f];
}

use selectors::*;

/// One detection rule: a capability, the capability it extends, and the
/// selectors that must all be present.
struct Rule {
    capability: Capability,
    requires: Option<Capability>,
    selectors: &'static [[u8; 4]],
}

/// Base rules come before the extensions that depend on them.
const RULES: &[Rule] = &[
    Rule {
        capability: Capability::Erc165,
        requires: None,
        selectors: &[SUPPORTS_INTERFACE],
    },
    Rule {
        capability: Capability::Erc20,
        requires: None,
        selectors: &[
            TOTAL_SUPPLY,
            BALANCE_OF,
            TRANSFER,
            ALLOWANCE,
            APPROVE,
            TRANSFER_FROM,
        ],
    },
    Rule {
        capability: Capability::Erc20Detailed,
        requires: Some(Capability::Erc20),
        selectors: &[NAME, SYMBOL, DECIMALS],
    },
    Rule {
        capability: Capability::Erc20Burnable,
        requires: Some(Capability::Erc20),
        selectors: &[BURN, BURN_FROM],
    },
    Rule {
        capability: Capability::Erc20Mintable,
        requires: Some(Capability::Erc20),
        selectors: &[MINT],
    },
    Rule {
        capability: Capability::Erc20Pausable,
        requires: Some(Capability::Erc20),
        selectors: &[PAUSE, UNPAUSE],
    },
    Rule {
        capability: Capability::Erc20Capped,
        requires: Some(Capability::Erc20),
        selectors: &[CAP],
    },
    Rule {
        capability: Capability::Erc721,
        requires: None,
        selectors: &[
            BALANCE_OF,
            OWNER_OF,
            SAFE_TRANSFER_FROM,
            SAFE_TRANSFER_FROM_DATA,
            TRANSFER_FROM,
            APPROVE,
            SET_APPROVAL_FOR_ALL,
            GET_APPROVED,
            IS_APPROVED_FOR_ALL,
        ],
    },
    Rule {
        capability: Capability::Erc721Metadata,
        requires: Some(Capability::Erc721),
        selectors: &[NAME, SYMBOL, TOKEN_URI],
    },
    Rule {
        capability: Capability::Erc721Enumerable,
        requires: Some(Capability::Erc721),
        selectors: &[TOTAL_SUPPLY, TOKEN_OF_OWNER_BY_INDEX, TOKEN_BY_INDEX],
    },
    Rule {
        capability: Capability::Erc1155,
        requires: None,
        selectors: &[
            SAFE_TRANSFER_FROM_1155,
            SAFE_BATCH_TRANSFER_FROM,
            BALANCE_OF_1155,
            BALANCE_OF_BATCH,
            SET_APPROVAL_FOR_ALL,
            IS_APPROVED_FOR_ALL,
        ],
    },
    Rule {
        capability: Capability::Erc1155TokenReceiver,
        requires: None,
        selectors: &[ON_ERC1155_RECEIVED, ON_ERC1155_BATCH_RECEIVED],
    },
    Rule {
        capability: Capability::Erc777,
        requires: None,
        selectors: &[
            NAME,
            SYMBOL,
            GRANULARITY,
            TOTAL_SUPPLY,
            BALANCE_OF,
            SEND,
            BURN_777,
            IS_OPERATOR_FOR,
            AUTHORIZE_OPERATOR,
            REVOKE_OPERATOR,
            DEFAULT_OPERATORS,
            OPERATOR_SEND,
            OPERATOR_BURN,
        ],
    },
];

// =============================================================================
// Detection
// =============================================================================

const PUSH1: u8 = 0x60;
const PUSH4: u8 = 0x63;
const PUSH32: u8 = 0x7f;

/// Selector-sized constants pushed by the bytecode.
///
/// Immediates of PUSH5..PUSH32 are skipped as data so that bytes inside
/// them are never read as opcodes. A truncated trailing push is ignored.
fn pushed_selectors(code: &[u8]) -> HashSet<[u8; 4]> {
    let mut found = HashSet::new();
    let mut pc = 0;
    while pc < code.len() {
        let op = code[pc];
        pc += 1;
        if !(PUSH1..=PUSH32).contains(&op) {
            continue;
        }
        let width = usize::from(op - PUSH1) + 1;
        let end = pc + width;
        if op <= PUSH4
            && let Some(immediate) = code.get(pc..end)
        {
            let mut selector = [0u8; 4];
            selector[4 - width..].copy_from_slice(immediate);
            found.insert(selector);
        }
        pc = end;
    }
    found
}

/// Classify bytecode. Pure: the same bytes always give the same set.
pub fn detect(code: &[u8]) -> ContractCapabilities {
    let pushed = pushed_selectors(code);
    let mut capabilities = ContractCapabilities::empty();
    for rule in RULES {
        if let Some(base) = rule.requires
            && !capabilities.contains(base)
        {
            continue;
        }
        if rule.selectors.iter().all(|s| pushed.contains(s)) {
            capabilities.insert(rule.capability);
        }
    }
    capabilities
}

// =============================================================================
// Cached Detector
// =============================================================================

/// Detector memoising results by `keccak256(code)`.
pub struct CapabilityDetector {
    cache: Mutex<LruCache<B256, ContractCapabilities>>,
}

impl CapabilityDetector {
    /// Default number of distinct bytecodes remembered.
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Classify `code`, consulting the cache first.
    pub fn detect_cached(&self, code: &[u8]) -> ContractCapabilities {
        let code_hash = keccak256(code);
        if let Some(hit) = self.cache.lock().get(&code_hash).copied() {
            record_capability_cache(true);
            return hit;
        }

        record_capability_cache(false);
        let capabilities = detect(code);
        trace!(code_hash = %code_hash, capabilities = %capabilities, "Bytecode classified");
        self.cache.lock().put(code_hash, capabilities);
        capabilities
    }

    /// Number of cached bytecodes.
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

impl Default for CapabilityDetector {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

/// Test helpers building dispatcher-like bytecode.
#[cfg(any(test, feature = "test-utils"))]
pub mod fixtures {
    pub use super::selectors::*;

    /// Bytecode comparing the call selector against each of `selectors`,
    /// the way a Solidity dispatcher does.
    pub fn dispatcher(selectors: &[[u8; 4]]) -> Vec<u8> {
        // PUSH1 0x80 PUSH1 0x40 MSTORE, then CALLDATALOAD/SHR prologue.
        let mut code = vec![0x60, 0x80, 0x60, 0x40, 0x52, 0x60, 0x00, 0x35, 0x60, 0xe0, 0x1c];
        for (i, selector) in selectors.iter().enumerate() {
            // DUP1 PUSH4 <selector> EQ PUSH2 <dest> JUMPI
            code.push(0x80);
            code.push(0x63);
            code.extend_from_slice(selector);
            code.push(0x14);
            code.push(0x61);
            code.extend_from_slice(&(0x0100u16 + i as u16).to_be_bytes());
            code.push(0x57);
        }
        code.push(0x00);
        code
    }

    pub const ERC20_BASE: [[u8; 4]; 6] = [
        TOTAL_SUPPLY,
        BALANCE_OF,
        TRANSFER,
        ALLOWANCE,
        APPROVE,
        TRANSFER_FROM,
    ];

    pub const ERC721_BASE: [[u8; 4]; 9] = [
        BALANCE_OF,
        OWNER_OF,
        SAFE_TRANSFER_FROM,
        SAFE_TRANSFER_FROM_DATA,
        TRANSFER_FROM,
        APPROVE,
        SET_APPROVAL_FOR_ALL,
        GET_APPROVED,
        IS_APPROVED_FOR_ALL,
    ];
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn set(capabilities: &[Capability]) -> ContractCapabilities {
        capabilities.iter().copied().collect()
    }

    // Test critique: les 6 sélecteurs ERC20 sans name/symbol/decimals => {ERC20} seul
    #[test]
    fn test_erc20_without_metadata_is_not_detailed() {
        let code = dispatcher(&ERC20_BASE);
        assert_eq!(detect(&code), set(&[Capability::Erc20]));
    }

    #[rstest]
    #[case::detailed(&[NAME, SYMBOL, DECIMALS], Capability::Erc20Detailed)]
    #[case::burnable(&[BURN, BURN_FROM], Capability::Erc20Burnable)]
    #[case::mintable(&[MINT], Capability::Erc20Mintable)]
    #[case::pausable(&[PAUSE, UNPAUSE], Capability::Erc20Pausable)]
    #[case::capped(&[CAP], Capability::Erc20Capped)]
    fn test_erc20_extensions(#[case] extra: &[[u8; 4]], #[case] expected: Capability) {
        let mut selectors = ERC20_BASE.to_vec();
        selectors.extend_from_slice(extra);
        assert_eq!(detect(&dispatcher(&selectors)), set(&[Capability::Erc20, expected]));
    }

    // Test critique: une extension n'est jamais marquée sans sa base
    #[test]
    fn test_extension_requires_base() {
        let code = dispatcher(&[NAME, SYMBOL, DECIMALS, MINT, CAP, TOTAL_SUPPLY]);
        assert!(detect(&code).is_empty());
    }

    #[test]
    fn test_erc721_with_independent_extensions() {
        let mut selectors = ERC721_BASE.to_vec();
        selectors.push(SUPPORTS_INTERFACE);
        selectors.extend_from_slice(&[NAME, SYMBOL, TOKEN_URI]);
        let metadata_only = detect(&dispatcher(&selectors));
        assert_eq!(
            metadata_only,
            set(&[Capability::Erc165, Capability::Erc721, Capability::Erc721Metadata])
        );

        selectors.extend_from_slice(&[TOTAL_SUPPLY, TOKEN_OF_OWNER_BY_INDEX, TOKEN_BY_INDEX]);
        let full = detect(&dispatcher(&selectors));
        assert!(full.contains(Capability::Erc721Enumerable));
        assert!(!full.contains(Capability::Erc20));
    }

    // Test critique: sélecteur avec octet de tête nul poussé via PUSH3
    #[test]
    fn test_erc1155_selector_with_leading_zero() {
        let mut code = dispatcher(&[
            SAFE_TRANSFER_FROM_1155,
            SAFE_BATCH_TRANSFER_FROM,
            BALANCE_OF_BATCH,
            SET_APPROVAL_FOR_ALL,
            IS_APPROVED_FOR_ALL,
            ON_ERC1155_RECEIVED,
            ON_ERC1155_BATCH_RECEIVED,
        ]);
        // solc optimise balanceOf(address,uint256) = 0x00fdd58e en PUSH3 0xfdd58e
        code.extend_from_slice(&[0x80, 0x62, 0xfd, 0xd5, 0x8e, 0x14]);

        let detected = detect(&code);
        assert!(detected.contains(Capability::Erc1155));
        assert!(detected.contains(Capability::Erc1155TokenReceiver));
        assert!(detected.is_non_fungible());
    }

    #[test]
    fn test_erc777_detected() {
        let code = dispatcher(&[
            NAME,
            SYMBOL,
            GRANULARITY,
            TOTAL_SUPPLY,
            BALANCE_OF,
            SEND,
            BURN_777,
            IS_OPERATOR_FOR,
            AUTHORIZE_OPERATOR,
            REVOKE_OPERATOR,
            DEFAULT_OPERATORS,
            OPERATOR_SEND,
            OPERATOR_BURN,
        ]);
        assert!(detect(&code).contains(Capability::Erc777));
    }

    // Test critique: les octets à l'intérieur d'un PUSH32 ne sont pas des opcodes
    #[test]
    fn test_push_data_is_not_scanned() {
        let mut code = vec![0x7f];
        let mut word = [0u8; 32];
        for (i, selector) in ERC20_BASE.iter().enumerate() {
            word[i * 5] = 0x63;
            word[i * 5 + 1..i * 5 + 5].copy_from_slice(selector);
        }
        code.extend_from_slice(&word);
        assert!(detect(&code).is_empty());

        // Les mêmes octets hors PUSH32 sont bien détectés
        assert_eq!(detect(&word), set(&[Capability::Erc20]));
    }

    #[test]
    fn test_truncated_push_is_ignored() {
        assert!(detect(&[0x63, 0xa9, 0x05]).is_empty());
        assert!(detect(&[]).is_empty());
    }

    #[test]
    fn test_cache_hits_on_same_bytecode() {
        let detector = CapabilityDetector::new(2);
        let code = dispatcher(&ERC20_BASE);
        let first = detector.detect_cached(&code);
        let second = detector.detect_cached(&code);
        assert_eq!(first, second);
        assert_eq!(detector.cached(), 1);

        detector.detect_cached(&[0x00]);
        detector.detect_cached(&[0x01]);
        // Capacité bornée
        assert_eq!(detector.cached(), 2);
    }

    proptest! {
        // Test critique: détection pure, même bytecode => même bitset
        #[test]
        fn prop_detection_is_pure(code in prop::collection::vec(any::<u8>(), 0..512)) {
            let detector = CapabilityDetector::default();
            let direct = detect(&code);
            prop_assert_eq!(direct, detect(&code));
            prop_assert_eq!(direct, detector.detect_cached(&code));
            prop_assert_eq!(direct, detector.detect_cached(&code));
        }
    }
}
