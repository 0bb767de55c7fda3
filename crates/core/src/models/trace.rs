//! Call trace arena.
//!
//! Frames are stored flat and reference their children by index, so deep
//! call chains never require recursion to build, walk or drop.

use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::decode_revert_reason;
use serde::{Deserialize, Serialize};

/// Index of a frame inside its [`CallTrace`].
pub type FrameId = usize;

/// Opcode that opened a call frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallKind {
    Call,
    CallCode,
    DelegateCall,
    StaticCall,
    Create,
    Create2,
    SelfDestruct,
}

impl CallKind {
    /// Parse the call tracer's `type` field.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CALL" => Some(Self::Call),
            "CALLCODE" => Some(Self::CallCode),
            "DELEGATECALL" => Some(Self::DelegateCall),
            "STATICCALL" => Some(Self::StaticCall),
            "CREATE" => Some(Self::Create),
            "CREATE2" => Some(Self::Create2),
            "SELFDESTRUCT" | "SUICIDE" => Some(Self::SelfDestruct),
            _ => None,
        }
    }

    pub fn is_create(self) -> bool {
        matches!(self, Self::Create | Self::Create2)
    }

    /// DELEGATECALL and STATICCALL execute foreign code but never carry value.
    pub fn moves_value(self) -> bool {
        !matches!(self, Self::DelegateCall | Self::StaticCall)
    }
}

/// One frame of a transaction's call tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFrame {
    pub kind: CallKind,
    pub from: Address,
    /// Callee; for CREATE frames the new contract, for SELFDESTRUCT the refund address.
    pub to: Option<Address>,
    pub value: U256,
    pub gas: u64,
    pub gas_used: u64,
    pub input: Bytes,
    /// Return data; deployed code for successful CREATE frames.
    pub output: Bytes,
    /// Set when the frame reverted or ran out of gas.
    pub error: Option<String>,
    pub children: Vec<FrameId>,
}

impl CallFrame {
    /// A frame without gas accounting or payload.
    pub fn new(kind: CallKind, from: Address, to: Option<Address>, value: U256) -> Self {
        Self {
            kind,
            from,
            to,
            value,
            gas: 0,
            gas_used: 0,
            input: Bytes::new(),
            output: Bytes::new(),
            error: None,
            children: Vec::new(),
        }
    }

    pub fn with_output(mut self, output: impl Into<Bytes>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Flat call tree of one transaction; frame 0 is the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTrace {
    frames: Vec<CallFrame>,
}

impl CallTrace {
    pub fn new(root: CallFrame) -> Self {
        Self { frames: vec![root] }
    }

    /// Append `frame` as the last child of `parent`.
    ///
    /// Returns `None` when `parent` does not exist.
    pub fn push_child(&mut self, parent: FrameId, frame: CallFrame) -> Option<FrameId> {
        let id = self.frames.len();
        self.frames.get_mut(parent)?.children.push(id);
        self.frames.push(frame);
        Some(id)
    }

    pub fn root(&self) -> Option<&CallFrame> {
        self.frames.first()
    }

    pub fn frame(&self, id: FrameId) -> Option<&CallFrame> {
        self.frames.get(id)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Revert reason of a failed root frame.
    ///
    /// Prefers the ABI-encoded `Error(string)` payload over the tracer's message.
    pub fn revert_reason(&self) -> Option<String> {
        let root = self.root()?;
        root.error.as_ref()?;
        Some(&root.output[..])
            .filter(|output| !output.is_empty())
            .and_then(decode_revert_reason)
            .filter(|reason| !reason.is_empty())
            .or_else(|| root.error.clone())
    }
}
