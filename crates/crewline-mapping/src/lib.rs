//! Source-column alias tables and per-entity row validation.

use crewline_core::{CanonicalRecord, EntityType, RawRow};
use thiserror::Error;

pub const CRATE_NAME: &str = "crewline-mapping";

/// Ordered `(source alias, target field)` pairs for one entity type.
///
/// Later entries overwrite earlier ones when two aliases land on the same
/// target, so each table lists higher-priority aliases last. No alias may map
/// to more than one target within a table.
pub type AliasTable = &'static [(&'static str, &'static str)];

const CUSTOMER_ALIASES: AliasTable = &[
    ("customer_name", "display_name"),
    ("full_name", "display_name"),
    ("name", "display_name"),
    ("display_name", "display_name"),
    ("first", "first_name"),
    ("first_name", "first_name"),
    ("surname", "last_name"),
    ("last", "last_name"),
    ("last_name", "last_name"),
    ("company", "company_name"),
    ("business_name", "company_name"),
    ("company_name", "company_name"),
    ("email_address", "email"),
    ("e_mail", "email"),
    ("email", "email"),
    ("telephone", "phone"),
    ("mobile", "phone"),
    ("phone_number", "phone"),
    ("phone", "phone"),
    ("street", "address"),
    ("street_address", "address"),
    ("address_line_1", "address"),
    ("address", "address"),
    ("town", "city"),
    ("city", "city"),
    ("province", "state"),
    ("state", "state"),
    ("zip_code", "zip"),
    ("postal_code", "zip"),
    ("zip", "zip"),
    ("comments", "notes"),
    ("notes", "notes"),
];

const JOB_ALIASES: AliasTable = &[
    ("job_title", "title"),
    ("job_name", "title"),
    ("name", "title"),
    ("title", "title"),
    ("details", "description"),
    ("description", "description"),
    ("customer", "customer_name"),
    ("customer_name", "customer_name"),
    ("status", "status"),
    ("type", "job_type"),
    ("job_type", "job_type"),
    ("date", "scheduled_date"),
    ("scheduled_date", "scheduled_date"),
    ("service_address", "address"),
    ("address", "address"),
    ("notes", "notes"),
];

const MATERIAL_ALIASES: AliasTable = &[
    ("material_name", "name"),
    ("item_name", "name"),
    ("item", "name"),
    ("name", "name"),
    ("description", "description"),
    ("part_number", "sku"),
    ("item_code", "sku"),
    ("sku", "sku"),
    ("cost", "unit_price"),
    ("price", "unit_price"),
    ("unit_price", "unit_price"),
    ("stock", "quantity"),
    ("qty", "quantity"),
    ("quantity", "quantity"),
    ("uom", "unit"),
    ("unit", "unit"),
    ("category", "category"),
    ("supplier", "vendor_name"),
    ("vendor", "vendor_name"),
    ("vendor_name", "vendor_name"),
];

const VENDOR_ALIASES: AliasTable = &[
    ("supplier", "name"),
    ("vendor_name", "name"),
    ("name", "name"),
    ("company", "display_name"),
    ("business_name", "display_name"),
    ("display_name", "display_name"),
    ("contact", "contact_name"),
    ("contact_name", "contact_name"),
    ("email_address", "email"),
    ("email", "email"),
    ("phone_number", "phone"),
    ("phone", "phone"),
    ("street_address", "address"),
    ("address", "address"),
    ("city", "city"),
    ("state", "state"),
    ("zip_code", "zip"),
    ("postal_code", "zip"),
    ("zip", "zip"),
    ("url", "website"),
    ("website", "website"),
    ("notes", "notes"),
];

pub fn alias_table(entity: EntityType) -> AliasTable {
    match entity {
        EntityType::Customer => CUSTOMER_ALIASES,
        EntityType::Job => JOB_ALIASES,
        EntityType::Material => MATERIAL_ALIASES,
        EntityType::Vendor => VENDOR_ALIASES,
    }
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("Unknown data type: {0}")]
    UnknownDataType(String),
}

/// Resolves an upload's `data_type` selector, the only hard failure in this
/// crate. Row validation failures are reported, never raised.
pub fn resolve_entity(data_type: &str) -> Result<EntityType, MappingError> {
    EntityType::parse(data_type).ok_or_else(|| MappingError::UnknownDataType(data_type.to_string()))
}

/// Outcome of mapping one raw row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRow {
    pub valid: bool,
    pub record: CanonicalRecord,
    pub errors: Vec<String>,
}

/// Lower-cases a source column header and collapses whitespace runs to `_`.
pub fn normalize_header(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Maps one raw row onto the entity's canonical fields and applies the
/// required-field rules. Pure: the same row always yields the same outcome.
pub fn map_and_validate(row: &RawRow, entity: EntityType, company_id: &str) -> MappedRow {
    let mut record = CanonicalRecord::new(entity);
    for (alias, target) in alias_table(entity) {
        if let Some(value) = row.get(*alias) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                record.set(*target, trimmed);
            }
        }
    }
    record.set("company_id", company_id);

    let mut errors = Vec::new();
    match entity {
        EntityType::Customer => {
            if !record.has("display_name") && !record.has("first_name") {
                errors.push("Customer name is required".to_string());
            } else if !record.has("display_name") {
                record.set("display_name", synthesize_display_name(&record));
            }
        }
        EntityType::Job => {
            if !record.has("title") {
                errors.push("Job title is required".to_string());
            }
        }
        EntityType::Material => {
            if !record.has("name") {
                errors.push("Material name is required".to_string());
            }
        }
        EntityType::Vendor => {
            if !record.has("name") && !record.has("display_name") {
                errors.push("Vendor name is required".to_string());
            } else if !record.has("display_name") {
                let name = record.get("name").unwrap_or_default().to_string();
                record.set("display_name", name);
            }
        }
    }

    MappedRow {
        valid: errors.is_empty(),
        record,
        errors,
    }
}

fn synthesize_display_name(record: &CanonicalRecord) -> String {
    let first = record.get("first_name").unwrap_or_default();
    let last = record.get("last_name").unwrap_or_default();
    format!("{first} {last}").trim().to_string()
}
