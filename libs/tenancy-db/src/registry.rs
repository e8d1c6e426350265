//! Link-time registry of tenant tables.
//!
//! `#[derive(TenantScoped)]` submits one [`TenantTableRegistration`] per
//! tenant-scoped entity, so the startup guard knows every table the binary
//! can touch without a hand-maintained list.

use std::collections::BTreeMap;

use crate::policy::{TableSource, TenantTable};

/// Emitted by the derive macro. Not meant to be constructed by hand.
#[derive(Debug, Clone, Copy)]
pub struct TenantTableRegistration {
    pub table: &'static str,
    pub tenant_column: &'static str,
    /// Module path of the entity, for diagnostics.
    pub entity: &'static str,
}

inventory::collect!(TenantTableRegistration);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("table '{table}' is registered with tenant column '{first}' by {first_entity} and '{second}' by {second_entity}")]
pub struct RegistryConflict {
    pub table: String,
    pub first: String,
    pub first_entity: String,
    pub second: String,
    pub second_entity: String,
}

/// All registered tenant tables, one entry per table, sorted by name.
///
/// # Errors
/// Returns `RegistryConflict` if two entities map the same table to
/// different tenant columns.
pub fn registered_tables() -> Result<Vec<TenantTable>, RegistryConflict> {
    collect(inventory::iter::<TenantTableRegistration>.into_iter().copied())
}

fn collect<I>(regs: I) -> Result<Vec<TenantTable>, RegistryConflict>
where
    I: IntoIterator<Item = TenantTableRegistration>,
{
    let mut by_table: BTreeMap<&'static str, TenantTableRegistration> = BTreeMap::new();
    for reg in regs {
        if let Some(seen) = by_table.get(reg.table) {
            if seen.tenant_column != reg.tenant_column {
                return Err(RegistryConflict {
                    table: reg.table.to_owned(),
                    first: seen.tenant_column.to_owned(),
                    first_entity: seen.entity.to_owned(),
                    second: reg.tenant_column.to_owned(),
                    second_entity: reg.entity.to_owned(),
                });
            }
            continue;
        }
        by_table.insert(reg.table, reg);
    }

    Ok(by_table
        .into_values()
        .map(|reg| TenantTable {
            table: reg.table.to_owned(),
            tenant_column: reg.tenant_column.to_owned(),
            source: TableSource::Entity(reg.entity),
        })
        .collect())
}
