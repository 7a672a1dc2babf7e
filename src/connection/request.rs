use std::fmt;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::ConnError;
use crate::types::{
    RegisterKind, MAX_READ_REGISTERS, MAX_READ_WRITE_REGISTERS, MAX_WRITE_BITS,
    MAX_WRITE_REGISTERS,
};

/// Data carried by a write request.
#[derive(Debug, Clone, PartialEq)]
pub enum WritePayload {
    Bits(Vec<bool>),
    Words(Vec<u16>),
    /// `(current & and_mask) | (or_mask & !and_mask)` applied by the slave.
    Mask { and_mask: u16, or_mask: u16 },
    /// Write `words` at the request address, then read `read_quantity` words
    /// from `read_address` in the same exchange.
    ReadWrite {
        read_address: u16,
        read_quantity: u16,
        words: Vec<u16>,
    },
}

/// One wire operation keyed by register kind, address and quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub kind: RegisterKind,
    pub address: u16,
    pub quantity: u16,
    pub write: Option<WritePayload>,
}

impl Request {
    pub fn read(kind: RegisterKind, address: u16, quantity: u16) -> Self {
        Self {
            kind,
            address,
            quantity,
            write: None,
        }
    }

    pub fn write_bits(address: u16, bits: Vec<bool>) -> Self {
        Self {
            kind: RegisterKind::Coil,
            address,
            quantity: u16::try_from(bits.len()).unwrap_or(u16::MAX),
            write: Some(WritePayload::Bits(bits)),
        }
    }

    pub fn write_words(address: u16, words: Vec<u16>) -> Self {
        Self {
            kind: RegisterKind::HoldingRegister,
            address,
            quantity: u16::try_from(words.len()).unwrap_or(u16::MAX),
            write: Some(WritePayload::Words(words)),
        }
    }

    pub fn mask_write(address: u16, and_mask: u16, or_mask: u16) -> Self {
        Self {
            kind: RegisterKind::HoldingRegister,
            address,
            quantity: 1,
            write: Some(WritePayload::Mask { and_mask, or_mask }),
        }
    }

    pub fn read_write(
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        words: Vec<u16>,
    ) -> Self {
        Self {
            kind: RegisterKind::HoldingRegister,
            address: write_address,
            quantity: u16::try_from(words.len()).unwrap_or(u16::MAX),
            write: Some(WritePayload::ReadWrite {
                read_address,
                read_quantity,
                words,
            }),
        }
    }

    pub fn is_write(&self) -> bool {
        self.write.is_some()
    }

    /// Rejects requests the wire would refuse: empty or oversized quantities,
    /// ranges past the end of the address space, and writes to read-only
    /// tables.
    pub fn validate(&self) -> Result<(), ConnError> {
        let invalid = |msg: String| Err(ConnError::Validation(msg));

        check_range(self.address, self.quantity)?;

        let Some(payload) = &self.write else {
            let max = self.kind.max_read_quantity();
            if self.quantity > max {
                return invalid(format!(
                    "cannot read {} {}s at once, limit is {max}",
                    self.quantity, self.kind
                ));
            }
            return Ok(());
        };

        if !self.kind.is_writable() {
            return invalid(format!("{}s are read-only", self.kind));
        }

        match payload {
            WritePayload::Bits(bits) => {
                if self.kind != RegisterKind::Coil {
                    return invalid(format!("bit payload cannot target {}s", self.kind));
                }
                if bits.len() != usize::from(self.quantity) || self.quantity > MAX_WRITE_BITS {
                    return invalid(format!(
                        "coil write of {} bits exceeds limit {MAX_WRITE_BITS}",
                        bits.len()
                    ));
                }
            }
            WritePayload::Words(words) => {
                if self.kind != RegisterKind::HoldingRegister {
                    return invalid(format!("word payload cannot target {}s", self.kind));
                }
                if words.len() != usize::from(self.quantity) || self.quantity > MAX_WRITE_REGISTERS
                {
                    return invalid(format!(
                        "register write of {} words exceeds limit {MAX_WRITE_REGISTERS}",
                        words.len()
                    ));
                }
            }
            WritePayload::Mask { .. } => {
                if self.kind != RegisterKind::HoldingRegister || self.quantity != 1 {
                    return invalid("mask write targets exactly one holding register".into());
                }
            }
            WritePayload::ReadWrite {
                read_address,
                read_quantity,
                words,
            } => {
                if self.kind != RegisterKind::HoldingRegister {
                    return invalid("read/write targets holding registers".into());
                }
                if words.len() != usize::from(self.quantity)
                    || self.quantity > MAX_READ_WRITE_REGISTERS
                {
                    return invalid(format!(
                        "read/write of {} words exceeds limit {MAX_READ_WRITE_REGISTERS}",
                        words.len()
                    ));
                }
                check_range(*read_address, *read_quantity)?;
                if *read_quantity > MAX_READ_REGISTERS {
                    return invalid(format!(
                        "cannot read {read_quantity} registers at once, limit is {MAX_READ_REGISTERS}"
                    ));
                }
            }
        }
        Ok(())
    }
}

fn check_range(address: u16, quantity: u16) -> Result<(), ConnError> {
    if quantity == 0 {
        return Err(ConnError::Validation("quantity must be at least 1".into()));
    }
    if u32::from(address) + u32::from(quantity) > 0x1_0000 {
        return Err(ConnError::Validation(format!(
            "address {address} + quantity {quantity} runs past 65535"
        )));
    }
    Ok(())
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match &self.write {
            None => "read",
            Some(WritePayload::Mask { .. }) => "mask write",
            Some(WritePayload::ReadWrite { .. }) => "read/write",
            Some(_) => "write",
        };
        write!(
            f,
            "{verb} {} {}..+{}",
            self.kind, self.address, self.quantity
        )
    }
}

/// Successful outcome of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Bits(Vec<bool>),
    Words(Vec<u16>),
    Written,
}

pub(crate) type Reply = oneshot::Sender<Result<Response, ConnError>>;

/// A request waiting in the connection queue.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub id: u64,
    pub request: Request,
    pub enqueued_at: Instant,
    pub reply: Option<Reply>,
}
