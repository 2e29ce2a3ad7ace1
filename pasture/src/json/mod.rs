//! The JSON repair and validation engine.
//!
//! Extraction, repair and schema validation are pure functions. The
//! patching loop adds model-assisted repair on top of them.

mod patch;
mod repair;
mod schema;

pub use patch::{patch_json_with_model, patch_prompt, patching_options, PATCHING_FAILED};
pub use repair::{
    extract_json, is_quality_response, is_valid_json, parse, repair_json, try_parse,
    wrap_text_as_json, EMPTY_RESPONSE, JSON_PARSING_FAILED,
};
pub use schema::{
    validate_with_schema, FieldSpec, FieldType, ObjectSchema, Schema, SchemaViolation, TypedSchema,
};
