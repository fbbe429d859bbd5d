//! Effect table emission.
//!
//! The table lists every effect of the linked program in id order with its
//! operations in op id order. It is written once into the module owning the
//! runtime ABI as a custom section that hosts locate by export name.

use tracing::debug;

use rill_runtime::effect_table::{EffectEntry, EffectTable, OpEntry, TableEncodeError};

use crate::config::EffectsConfig;
use crate::substrate::{BuildRegistry, CustomSection, Module};

/// Build the program-wide table from the registry.
///
/// Ops without a recorded host signature get hash 0.
pub fn build_effect_table(registry: &BuildRegistry, version: u32) -> EffectTable {
    let mut table = EffectTable::new(version);
    for effect in registry.effects() {
        let ops = effect
            .ops
            .iter()
            .enumerate()
            .map(|(op_id, op)| {
                let index = effect.first_op + op_id as u32;
                OpEntry {
                    op_id: op_id as u32,
                    name: op.name.clone(),
                    label: format!("{}.{}", effect.label, op.name),
                    resume_kind: op.resume,
                    signature_hash: registry.signature(index).map_or(0, |s| s.hash),
                }
            })
            .collect();
        table.effects.push(EffectEntry {
            effect_id: effect.id.0,
            name: effect.name.clone(),
            label: effect.label.clone(),
            ops,
        });
    }
    table
}

/// Encode the table and attach it to `module`.
pub fn attach_effect_table(
    module: &mut Module,
    table: &EffectTable,
    config: &EffectsConfig,
) -> Result<usize, TableEncodeError> {
    let bytes = table.encode()?;
    let len = bytes.len();
    debug!(
        module = module.name(),
        section = %config.section_name,
        effects = table.effects.len(),
        ops = table.op_count(),
        bytes = len,
        "attached effect table"
    );
    module.set_custom(CustomSection {
        name: config.section_name.clone(),
        export: Some(config.export_name.clone()),
        bytes,
    });
    Ok(len)
}
