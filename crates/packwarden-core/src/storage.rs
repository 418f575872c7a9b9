//! Layered values storage for a single package
//!
//! The result document is always recomputed from its layers:
//!
//! 1. static values read from the package directory
//! 2. defaults of the config schema
//! 3. user supplied config values
//! 4. defaults of the values schema
//! 5. accumulated value patches, applied leniently
//!
//! Schema defaults only fill gaps: they never override a value that an
//! earlier layer already set.
//!
//! Every mutation builds a complete new state before swapping it in, so a
//! failed call leaves the storage untouched. The values schema is checked
//! against the recomputed result, which is exactly what gets stored.

use parking_lot::RwLock;

use crate::error::{CoreError, Result};
use crate::patch::{PatchMode, ValuesPatch};
use crate::schema::OpenApiSchema;
use crate::values::Values;

#[derive(Debug, Clone)]
struct State {
    config_values: Values,
    patches: ValuesPatch,
    result: Values,
    config_checksum: String,
    values_checksum: String,
    config_version: u64,
}

/// Values of one package
#[derive(Debug)]
pub struct ValuesStorage {
    name: String,
    static_values: Values,
    config_schema: Option<OpenApiSchema>,
    values_schema: Option<OpenApiSchema>,
    state: RwLock<State>,
}

impl ValuesStorage {
    /// Build the storage and compute the initial result.
    ///
    /// Empty schema bytes mean the schema is not defined.
    pub fn new(
        name: impl Into<String>,
        static_values: Values,
        config_schema: &[u8],
        values_schema: &[u8],
    ) -> Result<Self> {
        let config_schema = OpenApiSchema::from_bytes(config_schema)?;
        let values_schema = OpenApiSchema::from_bytes(values_schema)?;
        Ok(Self::with_schemas(
            name,
            static_values,
            config_schema,
            values_schema,
        ))
    }

    /// Build from already compiled schemas
    pub fn with_schemas(
        name: impl Into<String>,
        static_values: Values,
        config_schema: Option<OpenApiSchema>,
        values_schema: Option<OpenApiSchema>,
    ) -> Self {
        let mut storage = Self {
            name: name.into(),
            static_values,
            config_schema,
            values_schema,
            state: RwLock::new(State::new(
                Values::new(),
                ValuesPatch::default(),
                Values::new(),
                0,
            )),
        };

        let base = storage.base_values(&Values::new());
        *storage.state.get_mut() = State::new(Values::new(), ValuesPatch::default(), base, 0);
        storage
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the config layer.
    ///
    /// Fails when the values do not satisfy the config schema, or when
    /// non-empty values are supplied without a config schema.
    pub fn apply_config_values(&self, values: Values) -> Result<()> {
        let values = if values.inner().is_null() {
            Values::new()
        } else {
            values
        };

        match &self.config_schema {
            Some(schema) => {
                let mut candidate = schema.defaults();
                candidate.merge(&values);
                schema.validate(candidate.inner())?;
            }
            None if !values.is_empty() => {
                return Err(CoreError::SchemaNotDefined {
                    name: self.name.clone(),
                });
            }
            None => {}
        }

        let mut state = self.state.write();
        let next = self.build_state(values, state.patches.clone(), state.config_version + 1)?;
        *state = next;

        tracing::debug!(package = %self.name, checksum = %state.config_checksum, "config values applied");
        Ok(())
    }

    /// Apply a values patch produced by a hook.
    ///
    /// Every target must exist in the current result. The recomputed result
    /// is validated against the values schema before it is kept.
    pub fn apply_patch(&self, patch: &ValuesPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut state = self.state.write();

        patch.apply(state.result.inner(), PatchMode::Strict)?;

        let mut patches = state.patches.clone();
        patches.compact_with(patch);

        let next = self.build_state(state.config_values.clone(), patches, state.config_version)?;
        if let Some(schema) = &self.values_schema {
            schema.validate(next.result.inner())?;
        }
        *state = next;

        tracing::debug!(package = %self.name, checksum = %state.values_checksum, "values patch applied");
        Ok(())
    }

    /// Current merged values
    pub fn get_values(&self) -> Values {
        self.state.read().result.clone()
    }

    /// Current user config values
    pub fn get_config_values(&self) -> Values {
        self.state.read().config_values.clone()
    }

    pub fn get_values_checksum(&self) -> String {
        self.state.read().values_checksum.clone()
    }

    pub fn get_config_checksum(&self) -> String {
        self.state.read().config_checksum.clone()
    }

    /// Incremented on every successful config replacement
    pub fn config_version(&self) -> u64 {
        self.state.read().config_version
    }

    /// Accumulated value patches
    pub fn patches(&self) -> ValuesPatch {
        self.state.read().patches.clone()
    }

    pub fn has_config_schema(&self) -> bool {
        self.config_schema.is_some()
    }

    /// Static values, config values and schema defaults, without patches
    fn base_values(&self, config_values: &Values) -> Values {
        let mut merged = match &self.config_schema {
            Some(schema) => {
                let mut filled = schema.defaults();
                filled.merge(&self.static_values);
                filled
            }
            None => self.static_values.clone(),
        };
        merged.merge(config_values);

        if let Some(schema) = &self.values_schema {
            let mut filled = schema.defaults();
            filled.merge(&merged);
            merged = filled;
        }

        merged
    }

    fn build_state(
        &self,
        config_values: Values,
        patches: ValuesPatch,
        config_version: u64,
    ) -> Result<State> {
        let base = self.base_values(&config_values);
        // Missing paths are skipped; malformed operations fail the call
        let result = Values::from(patches.apply(base.inner(), PatchMode::Lenient)?);
        Ok(State::new(config_values, patches, result, config_version))
    }
}

impl State {
    fn new(config_values: Values, patches: ValuesPatch, result: Values, config_version: u64) -> Self {
        Self {
            config_checksum: config_values.checksum(),
            values_checksum: result.checksum(),
            config_values,
            patches,
            result,
            config_version,
        }
    }
}
