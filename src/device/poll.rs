//! Poll planning: turn a register set into the fewest wire reads.

use crate::types::{DataType, RegisterConfig, RegisterKind};

/// One read request covering contiguous registers of a single kind and type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRun {
    pub kind: RegisterKind,
    pub address: u16,
    pub quantity: u16,
    pub data_type: DataType,
    /// Start addresses of the registers served by this run, ascending.
    pub registers: Vec<u16>,
}

impl ReadRun {
    fn start(config: &RegisterConfig) -> Self {
        Self {
            kind: config.kind,
            address: config.address,
            quantity: config.quantity(),
            data_type: config.data_type,
            registers: vec![config.address],
        }
    }

    /// Offset of `address` from the start of the run, in registers or bits.
    pub fn offset_of(&self, address: u16) -> usize {
        usize::from(address.saturating_sub(self.address))
    }
}

/// Groups registers by kind, orders them by address and merges a register
/// into the current run when it starts right after the previous one and has
/// the same data type. Runs never exceed the protocol read limit.
pub fn coalesce(configs: &[RegisterConfig]) -> Vec<ReadRun> {
    let mut sorted: Vec<&RegisterConfig> = configs.iter().collect();
    sorted.sort_by_key(|c| (c.kind, c.address));

    let mut runs: Vec<ReadRun> = Vec::new();
    let mut previous: Option<&RegisterConfig> = None;
    for config in sorted {
        let extends = match (runs.last(), previous) {
            (Some(run), Some(prev)) => {
                run.kind == config.kind
                    && prev.data_type == config.data_type
                    && u32::from(config.address)
                        == u32::from(prev.address) + u32::from(prev.quantity())
                    && u32::from(run.quantity) + u32::from(config.quantity())
                        <= u32::from(config.kind.max_read_quantity())
            }
            _ => false,
        };
        match runs.last_mut() {
            Some(run) if extends => {
                run.quantity += config.quantity();
                run.registers.push(config.address);
            }
            _ => runs.push(ReadRun::start(config)),
        }
        previous = Some(config);
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holding(address: u16, data_type: DataType) -> RegisterConfig {
        RegisterConfig::new(address, data_type, RegisterKind::HoldingRegister)
    }

    fn spans(runs: &[ReadRun]) -> Vec<(u16, u16)> {
        runs.iter().map(|r| (r.address, r.quantity)).collect()
    }

    #[test]
    fn contiguous_words_share_a_run() {
        let configs = [
            holding(20, DataType::Word),
            holding(10, DataType::Word),
            holding(12, DataType::Word),
            holding(11, DataType::Word),
        ];
        let runs = coalesce(&configs);
        assert_eq!(spans(&runs), vec![(10, 3), (20, 1)]);
        assert_eq!(runs[0].registers, vec![10, 11, 12]);
    }

    #[test]
    fn type_boundaries_split_runs() {
        let configs = [
            holding(10, DataType::Word),
            holding(11, DataType::DInt32),
            holding(12, DataType::Word),
        ];
        let runs = coalesce(&configs);
        assert_eq!(spans(&runs), vec![(10, 1), (11, 2), (12, 1)]);
    }

    #[test]
    fn multi_word_types_advance_by_their_width() {
        let configs = [
            holding(0, DataType::Float32),
            holding(2, DataType::Float32),
            holding(4, DataType::Float32),
            holding(8, DataType::Float64),
            holding(12, DataType::Float64),
        ];
        assert_eq!(spans(&coalesce(&configs)), vec![(0, 6), (8, 8)]);
    }

    #[test]
    fn kinds_never_mix() {
        let configs = [
            RegisterConfig::new(0, DataType::Bit, RegisterKind::Coil),
            RegisterConfig::new(1, DataType::Bit, RegisterKind::Coil),
            RegisterConfig::new(2, DataType::Bit, RegisterKind::DiscreteInput),
            RegisterConfig::new(3, DataType::Word, RegisterKind::InputRegister),
            holding(4, DataType::Word),
        ];
        let runs = coalesce(&configs);
        let kinds: Vec<_> = runs.iter().map(|r| (r.kind, r.address, r.quantity)).collect();
        assert_eq!(
            kinds,
            vec![
                (RegisterKind::Coil, 0, 2),
                (RegisterKind::DiscreteInput, 2, 1),
                (RegisterKind::InputRegister, 3, 1),
                (RegisterKind::HoldingRegister, 4, 1),
            ]
        );
    }

    #[test]
    fn runs_respect_the_read_limit() {
        let configs: Vec<_> = (0..130).map(|a| holding(a, DataType::Word)).collect();
        assert_eq!(spans(&coalesce(&configs)), vec![(0, 125), (125, 5)]);
    }

    #[test]
    fn offsets_locate_registers_inside_a_run() {
        let runs = coalesce(&[holding(40, DataType::DWord), holding(42, DataType::DWord)]);
        assert_eq!(runs[0].offset_of(42), 2);
    }
}
