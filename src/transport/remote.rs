//! The cluster-interconnect ("SmartIO") remote admin transport wire
//! format: the shared-memory binding table, the RPC request/reply
//! frames, and the client-side bind/send sequence (`src/dis/rpc.c` in
//! the original driver: `struct handle_info`/`rpc_cmd`/`rpc_cpl`,
//! `try_bind`, `remote_command`). Treated as an external collaborator —
//! this module reproduces the wire contract exactly (spec §6) as the
//! seam a real interconnect client plugs into; it does not drive actual
//! SISCI/DIS hardware or interrupts, which are out of this driver's
//! scope (spec §1).

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::cmd::COMMAND_SIZE;
use crate::error::{CompletionStatus, NvmeError, Result};
use crate::transport::AdminTransport;

/// Magic signature a server binding writes into its shared-memory table
/// slot (`RPC_MAGIC_SIGNATURE` in `src/dis/rpc.c`).
pub const RPC_MAGIC_SIGNATURE: u32 = 0xDEAD_BEEF;

/// One entry of the shared device-memory table a server binding
/// advertises itself through, indexed by adapter number
/// (`struct handle_info`: `{magic, node_id, intr_no}`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleInfo {
    pub magic: u32,
    pub node_id: u32,
    pub intr_no: u32,
}

impl HandleInfo {
    pub const ZERO: HandleInfo = HandleInfo {
        magic: 0,
        node_id: 0,
        intr_no: 0,
    };

    /// Whether this slot currently advertises a bound server.
    pub fn is_bound(&self) -> bool {
        self.magic == RPC_MAGIC_SIGNATURE
    }
}

/// One RPC request frame: the initiator's node id and the interrupt
/// number it expects the reply on, plus the 64-byte command verbatim
/// (`struct rpc_cmd`).
#[repr(C)]
#[derive(Debug, Clone)]
pub struct RpcCmd {
    pub initiator_node_id: u32,
    pub reply_intr_no: u32,
    pub cmd: [u8; COMMAND_SIZE],
}

impl RpcCmd {
    const WIRE_SIZE: usize = 4 + 4 + COMMAND_SIZE;

    fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0..4].copy_from_slice(&self.initiator_node_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.reply_intr_no.to_le_bytes());
        out[8..8 + COMMAND_SIZE].copy_from_slice(&self.cmd);
        out
    }
}

/// One RPC reply frame: the (possibly modified) command — all-zero
/// signals the server rejected the request — plus the 16-byte
/// completion (`struct rpc_cpl`).
#[repr(C)]
#[derive(Debug, Clone)]
pub struct RpcCpl {
    pub cmd: [u8; COMMAND_SIZE],
    pub cpl: [u8; 16],
}

impl RpcCpl {
    const WIRE_SIZE: usize = COMMAND_SIZE + 16;

    fn from_wire(bytes: &[u8; Self::WIRE_SIZE]) -> RpcCpl {
        let mut cmd = [0u8; COMMAND_SIZE];
        cmd.copy_from_slice(&bytes[0..COMMAND_SIZE]);
        let mut cpl = [0u8; 16];
        cpl.copy_from_slice(&bytes[COMMAND_SIZE..COMMAND_SIZE + 16]);
        RpcCpl { cmd, cpl }
    }

    /// An all-zero `cmd` field signals the server rejected the request
    /// (spec §4.6, §6).
    pub fn rejected(&self) -> bool {
        self.cmd.iter().all(|&b| b == 0)
    }
}

/// Scan a server's shared-memory table for the first slot whose magic
/// matches [`RPC_MAGIC_SIGNATURE`], returning the `(node_id, intr_no)`
/// a real client would pass to its interconnect's "connect data
/// interrupt" call (`try_bind` in `src/dis/rpc.c`).
pub fn find_bound_slot(table: &[HandleInfo]) -> Option<(u32, u32)> {
    table.iter().find(|h| h.is_bound()).map(|h| (h.node_id, h.intr_no))
}

fn write_request(stream: &mut TcpStream, request: &RpcCmd) -> std::io::Result<()> {
    stream.write_all(&request.to_wire())
}

fn read_reply(stream: &mut TcpStream) -> std::io::Result<RpcCpl> {
    let mut bytes = [0u8; RpcCpl::WIRE_SIZE];
    stream.read_exact(&mut bytes)?;
    Ok(RpcCpl::from_wire(&bytes))
}

/// An admin reference bound to a remote admin server over the RPC wire
/// format above. Binding scans `table` for an advertised slot the way
/// `try_bind` does; the TCP stream here stands in for the data
/// interrupt / shared-memory channel a real interconnect transport
/// would use to carry the same frames.
pub struct RemoteTransport {
    stream: TcpStream,
    node_id: u32,
    intr_no: u32,
    reply_intr_no: u32,
}

impl RemoteTransport {
    /// Connect to `addr` and bind to the server advertised in `table`,
    /// replying on `reply_intr_no` (this client's own interrupt number).
    pub fn connect(addr: &str, table: &[HandleInfo], reply_intr_no: u32) -> Result<RemoteTransport> {
        let (node_id, intr_no) = find_bound_slot(table).ok_or(NvmeError::NoDevice)?;
        let stream = TcpStream::connect(addr).map_err(NvmeError::Io)?;
        stream.set_nodelay(true).map_err(NvmeError::Io)?;
        Ok(RemoteTransport {
            stream,
            node_id,
            intr_no,
            reply_intr_no,
        })
    }

    /// Remote node id this transport is bound to.
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Remote callback interrupt number this transport triggers on send.
    pub fn intr_no(&self) -> u32 {
        self.intr_no
    }
}

impl AdminTransport for RemoteTransport {
    fn send(&mut self, command: &[u8; COMMAND_SIZE], completion_dw0: &mut u32) -> i32 {
        let request = RpcCmd {
            initiator_node_id: self.node_id,
            reply_intr_no: self.reply_intr_no,
            cmd: *command,
        };
        if let Err(e) = write_request(&mut self.stream, &request) {
            return NvmeError::Io(e).to_raw();
        }
        let reply = match read_reply(&mut self.stream) {
            Ok(reply) => reply,
            Err(e) => return NvmeError::Io(e).to_raw(),
        };
        if reply.rejected() {
            return NvmeError::PermissionDenied.to_raw();
        }

        let dw0 = u32::from_le_bytes([reply.cpl[0], reply.cpl[1], reply.cpl[2], reply.cpl[3]]);
        let status = CompletionStatus(u16::from_le_bytes([reply.cpl[14], reply.cpl[15]]));
        *completion_dw0 = dw0;
        if status.is_ok() {
            0
        } else {
            NvmeError::Completion(status.0).to_raw()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_bound_slot_skips_unbound_entries() {
        let table = [
            HandleInfo::ZERO,
            HandleInfo {
                magic: RPC_MAGIC_SIGNATURE,
                node_id: 7,
                intr_no: 42,
            },
            HandleInfo::ZERO,
        ];
        assert_eq!(find_bound_slot(&table), Some((7, 42)));
    }

    #[test]
    fn find_bound_slot_rejects_wrong_magic() {
        let table = [HandleInfo {
            magic: 0x1234,
            node_id: 1,
            intr_no: 1,
        }];
        assert_eq!(find_bound_slot(&table), None);
    }

    #[test]
    fn rpc_cmd_wire_layout_matches_packed_c_struct() {
        let request = RpcCmd {
            initiator_node_id: 0x1122_3344,
            reply_intr_no: 0x5566_7788,
            cmd: [0xAB; COMMAND_SIZE],
        };
        let wire = request.to_wire();
        assert_eq!(&wire[0..4], &0x1122_3344u32.to_le_bytes());
        assert_eq!(&wire[4..8], &0x5566_7788u32.to_le_bytes());
        assert_eq!(&wire[8..], &[0xAB; COMMAND_SIZE][..]);
    }

    #[test]
    fn all_zero_reply_cmd_signals_rejection() {
        let mut bytes = [0u8; RpcCpl::WIRE_SIZE];
        bytes[COMMAND_SIZE] = 0x01; // nonzero completion byte, zero cmd
        let reply = RpcCpl::from_wire(&bytes);
        assert!(reply.rejected());
    }

    #[test]
    fn nonzero_reply_cmd_is_not_rejected() {
        let mut bytes = [0u8; RpcCpl::WIRE_SIZE];
        bytes[0] = 0x06; // echoed opcode byte
        let reply = RpcCpl::from_wire(&bytes);
        assert!(!reply.rejected());
    }
}
