//! `lembed_models`: the registry as an eponymous, writable virtual table.

use std::os::raw::c_int;

use lembed_core::model::{HANDLE_PREFIX, ModelSource};
use lembed_core::options::{ModelOptions, OptionsError};
use lembed_core::registry::{EntryInfo, ModelRef};
use rusqlite::types::{Null, Value, ValueRef};
use rusqlite::vtab::{
    Context, CreateVTab, IndexInfo, UpdateVTab, VTab, VTabConnection, VTabCursor, VTabKind,
    Values, update_module,
};
use rusqlite::{Connection, Error, Result, ffi};

use crate::{SharedRegistry, lock};

const SCHEMA: &str = "CREATE TABLE x(name TEXT, model, dimensions INTEGER, n_ctx INTEGER, pooling_type TEXT, options HIDDEN, context_options HIDDEN)";

const COLUMN_NAME: c_int = 0;
const COLUMN_MODEL: c_int = 1;
const COLUMN_DIMENSIONS: c_int = 2;
const COLUMN_N_CTX: c_int = 3;
const COLUMN_POOLING_TYPE: c_int = 4;
const COLUMN_OPTIONS: c_int = 5;
const COLUMN_CONTEXT_OPTIONS: c_int = 6;

pub(crate) fn register(conn: &Connection, registry: &SharedRegistry) -> Result<()> {
    conn.create_module("lembed_models", update_module::<ModelsTable>(), Some(registry.clone()))
}

fn module_error(msg: impl Into<String>) -> Error {
    Error::ModuleError(msg.into())
}

#[repr(C)]
struct ModelsTable {
    /// Base class. Must be first
    base: ffi::sqlite3_vtab,
    registry: SharedRegistry,
}

unsafe impl<'vtab> VTab<'vtab> for ModelsTable {
    type Aux = SharedRegistry;
    type Cursor = ModelsCursor;

    fn connect(
        _db: &mut VTabConnection,
        aux: Option<&SharedRegistry>,
        _args: &[&[u8]],
    ) -> Result<(String, Self)> {
        let registry = aux
            .cloned()
            .ok_or_else(|| module_error("lembed_models: registry missing"))?;
        Ok((
            SCHEMA.to_owned(),
            Self {
                base: ffi::sqlite3_vtab::default(),
                registry,
            },
        ))
    }

    fn best_index(&self, info: &mut IndexInfo) -> Result<()> {
        info.set_estimated_cost(10.0);
        Ok(())
    }

    fn open(&'vtab mut self) -> Result<ModelsCursor> {
        Ok(ModelsCursor {
            base: ffi::sqlite3_vtab_cursor::default(),
            registry: self.registry.clone(),
            rows: Vec::new(),
            position: 0,
        })
    }
}

impl CreateVTab<'_> for ModelsTable {
    const KIND: VTabKind = VTabKind::EponymousOnly;
}

impl UpdateVTab<'_> for ModelsTable {
    fn delete(&mut self, arg: ValueRef<'_>) -> Result<()> {
        let ValueRef::Integer(rowid) = arg else {
            return Err(module_error("lembed_models: invalid rowid"));
        };
        lock(&self.registry).map_err(module_error)?.remove(rowid);
        Ok(())
    }

    fn insert(&mut self, args: &Values<'_>) -> Result<i64> {
        // args[0] is the old rowid, args[1] the new one, then one per column.
        let column = |c: c_int| c as usize + 2;
        let name: Option<String> = args.get(column(COLUMN_NAME))?;
        let model: Value = args.get(column(COLUMN_MODEL))?;
        let options = options_column(args, column(COLUMN_OPTIONS))?;
        let context = options_column(args, column(COLUMN_CONTEXT_OPTIONS))?;
        let options = match (options, context) {
            (options, None) => options,
            (options, Some(context)) => {
                if let Some(key) = context.set_keys().into_iter().find(|k| !k.is_context()) {
                    return Err(module_error(
                        OptionsError::NotContextOption(key.as_str().to_string()).to_string(),
                    ));
                }
                let mut merged = options.unwrap_or_default();
                merged
                    .merge(&context)
                    .map_err(|e| module_error(e.to_string()))?;
                Some(merged)
            }
        };

        let mut registry = lock(&self.registry).map_err(module_error)?;
        let model = match model {
            Value::Text(handle) if handle.starts_with(HANDLE_PREFIX) => {
                if options.is_some() {
                    return Err(module_error(
                        "options cannot be applied to an already loaded model",
                    ));
                }
                let loaded = registry.resolve_reference(Some(&handle))
                    .map_err(|e| module_error(e.to_string()))?;
                ModelRef::Loaded(loaded)
            }
            Value::Text(path) => {
                ModelRef::Source(ModelSource::path(path), options.unwrap_or_default())
            }
            Value::Blob(bytes) => {
                ModelRef::Source(ModelSource::Bytes(bytes), options.unwrap_or_default())
            }
            _ => {
                return Err(module_error(
                    "lembed_models: model must be a model handle, a path or a model blob",
                ));
            }
        };

        registry
            .register(name.as_deref(), model)
            .map_err(|e| module_error(e.to_string()))
    }

    fn update(&mut self, _args: &Values<'_>) -> Result<()> {
        Err(module_error("lembed_models rows cannot be updated"))
    }
}

/// A NULL column, or an options object from `lembed_model_options` /
/// `lembed_context_options`.
fn options_column(args: &Values<'_>, index: usize) -> Result<Option<ModelOptions>> {
    let json: Option<String> = args.get(index)?;
    json.map(|json| ModelOptions::from_json(&json))
        .transpose()
        .map_err(|e| module_error(e.to_string()))
}

#[repr(C)]
struct ModelsCursor {
    /// Base class. Must be first
    base: ffi::sqlite3_vtab_cursor,
    registry: SharedRegistry,
    /// Snapshot taken at filter time.
    rows: Vec<EntryInfo>,
    position: usize,
}

impl ModelsCursor {
    fn current(&self) -> Result<&EntryInfo> {
        self.rows
            .get(self.position)
            .ok_or_else(|| module_error("lembed_models: cursor is past the last row"))
    }
}

unsafe impl VTabCursor for ModelsCursor {
    fn filter(&mut self, _idx_num: c_int, _idx_str: Option<&str>, _args: &Values<'_>) -> Result<()> {
        self.rows = lock(&self.registry).map_err(module_error)?.list();
        self.position = 0;
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        self.position += 1;
        Ok(())
    }

    fn eof(&self) -> bool {
        self.position >= self.rows.len()
    }

    fn column(&self, ctx: &mut Context, i: c_int) -> Result<()> {
        let row = self.current()?;
        match i {
            COLUMN_NAME => ctx.set_result(&row.name),
            COLUMN_MODEL => ctx.set_result(&Null),
            COLUMN_DIMENSIONS => ctx.set_result(&(row.dimensions as i64)),
            COLUMN_N_CTX => ctx.set_result(&(row.context_window as i64)),
            COLUMN_POOLING_TYPE => ctx.set_result(&row.pooling_type.as_str()),
            COLUMN_OPTIONS => ctx.set_result(&row.options.to_json()),
            COLUMN_CONTEXT_OPTIONS => ctx.set_result(&row.options.context_only().to_json()),
            _ => Err(module_error(format!("lembed_models: no column {i}"))),
        }
    }

    fn rowid(&self) -> Result<i64> {
        Ok(self.current()?.rowid)
    }
}
