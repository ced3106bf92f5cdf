/*!
# Bastion Protocol - shared vocabulary between kernel and agents

Library used by both sides of the control plane:
- Rule model and canonical `iptables` text (render + strict parse)
- Discovery datagrams and command result messages
- Length-prefixed framing for the command stream
- A mock agent for exercising the kernel without a real device
*/

pub mod rule;
pub mod wire;
pub mod frame;
pub mod test_utils;

pub use rule::{AddrSpec, Chain, GrammarError, Protocol, RuleSpec, Verdict};
pub use wire::{
    CommandResult, DiscoveryMessage, FailureReason, ResultStatus, WireError, MAX_DATAGRAM_LEN, MAX_DETAIL_LEN,
    PROTOCOL_VERSION,
};
pub use frame::{read_frame, write_frame, FrameError, MAX_FRAME_LEN};
pub use test_utils::{MockAgent, MockReply};
