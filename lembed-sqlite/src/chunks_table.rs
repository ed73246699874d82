//! `lembed_chunks` and `lembed_batch`: table-valued functions yielding one
//! embedded row per chunk of a long text, or per element of a JSON array.
//!
//! Parameters are hidden columns bound through equality constraints, so both
//! `lembed_chunks('model', 'text')` and `... WHERE source = ?` work. Rows are
//! embedded one at a time as the cursor advances; the first failing row ends
//! the statement with that row's error.

use std::marker::PhantomData;
use std::os::raw::c_int;
use std::sync::Arc;

use lembed_core::Model;
use lembed_core::chunks::{BatchPlan, BatchRow, ChunkOptions, ChunkPlan, ChunkRow};
use rusqlite::types::Value;
use rusqlite::vtab::{
    Context, IndexConstraintOp, IndexInfo, VTab, VTabConnection, VTabCursor, Values,
    eponymous_only_module,
};
use rusqlite::{Connection, Error, Result, ffi};

use crate::{SharedRegistry, resolve};

pub(crate) fn register(conn: &Connection, registry: &SharedRegistry) -> Result<()> {
    conn.create_module(
        "lembed_chunks",
        eponymous_only_module::<ChunksTable>(),
        Some(registry.clone()),
    )?;
    conn.create_module(
        "lembed_batch",
        eponymous_only_module::<BatchTable>(),
        Some(registry.clone()),
    )
}

fn module_error(msg: impl Into<String>) -> Error {
    Error::ModuleError(msg.into())
}

/// Bind equality constraints on the hidden parameter columns
/// `first..first + count` to filter arguments, in column order.
///
/// `idx_num` gets bit `n` set when parameter `n` is bound. A required
/// parameter that is constrained but not usable rejects the plan; one that is
/// not constrained at all is an error.
fn bind_parameters(
    info: &mut IndexInfo,
    first: c_int,
    count: c_int,
    required: c_int,
    required_message: &str,
) -> Result<()> {
    let mut slots: Vec<Option<usize>> = vec![None; count as usize];
    let mut required_unusable = false;
    for (i, constraint) in info.constraints().enumerate() {
        let offset = constraint.column() - first;
        if !(0..count).contains(&offset) {
            continue;
        }
        if constraint.operator() != IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_EQ {
            continue;
        }
        if !constraint.is_usable() {
            if offset == required {
                required_unusable = true;
            }
            continue;
        }
        slots[offset as usize] = Some(i);
    }

    if slots[required as usize].is_none() {
        if required_unusable {
            return Err(Error::SqliteFailure(
                ffi::Error::new(ffi::SQLITE_CONSTRAINT),
                None,
            ));
        }
        return Err(module_error(required_message));
    }

    let mut idx_num = 0;
    let mut argv_index = 0;
    for (offset, slot) in slots.iter().enumerate() {
        if let Some(i) = slot {
            argv_index += 1;
            let mut usage = info.constraint_usage(*i);
            usage.set_argv_index(argv_index);
            usage.set_omit(true);
            idx_num |= 1 << offset;
        }
    }
    info.set_idx_num(idx_num);
    info.set_estimated_cost(10.0);
    Ok(())
}

/// Filter arguments keyed by parameter position.
struct Parameters<'a> {
    idx_num: c_int,
    args: &'a Values<'a>,
}

impl Parameters<'_> {
    /// Value of parameter `offset`, or NULL when it was not bound.
    fn get(&self, offset: c_int) -> Result<Value> {
        if self.idx_num & (1 << offset) == 0 {
            return Ok(Value::Null);
        }
        let position = (0..offset)
            .filter(|bit| self.idx_num & (1 << bit) != 0)
            .count();
        self.args.get(position)
    }

    fn model_name(&self, offset: c_int) -> Result<Option<String>> {
        match self.get(offset)? {
            Value::Null => Ok(None),
            Value::Text(name) => Ok(Some(name)),
            _ => Err(module_error("model must be a model name or handle")),
        }
    }

    fn text(&self, offset: c_int, what: &str) -> Result<String> {
        match self.get(offset)? {
            Value::Text(text) => Ok(text),
            _ => Err(module_error(format!("{what} must be text"))),
        }
    }

    fn count(&self, offset: c_int, what: &str) -> Result<Option<usize>> {
        match self.get(offset)? {
            Value::Null => Ok(None),
            Value::Integer(n) => usize::try_from(n)
                .map(Some)
                .map_err(|_| module_error(format!("{what} must not be negative"))),
            _ => Err(module_error(format!("{what} must be an integer"))),
        }
    }
}

fn model_for(registry: &SharedRegistry, name: Option<String>) -> Result<Arc<Model>> {
    resolve(registry, name.as_deref()).map_err(module_error)
}

const CHUNKS_SCHEMA: &str = "CREATE TABLE x(chunk_index INTEGER, contents TEXT, token_count INTEGER, embedding BLOB, model HIDDEN, source HIDDEN, chunk_size HIDDEN, overlap HIDDEN)";

const CHUNKS_INDEX: c_int = 0;
const CHUNKS_CONTENTS: c_int = 1;
const CHUNKS_TOKEN_COUNT: c_int = 2;
const CHUNKS_EMBEDDING: c_int = 3;
const CHUNKS_FIRST_PARAMETER: c_int = 4;

const PARAM_MODEL: c_int = 0;
const PARAM_SOURCE: c_int = 1;
const PARAM_CHUNK_SIZE: c_int = 2;
const PARAM_OVERLAP: c_int = 3;

#[repr(C)]
struct ChunksTable {
    /// Base class. Must be first
    base: ffi::sqlite3_vtab,
    registry: SharedRegistry,
}

unsafe impl<'vtab> VTab<'vtab> for ChunksTable {
    type Aux = SharedRegistry;
    type Cursor = ChunksCursor<'vtab>;

    fn connect(
        _db: &mut VTabConnection,
        aux: Option<&SharedRegistry>,
        _args: &[&[u8]],
    ) -> Result<(String, Self)> {
        let registry = aux
            .cloned()
            .ok_or_else(|| module_error("lembed_chunks: registry missing"))?;
        Ok((
            CHUNKS_SCHEMA.to_owned(),
            Self {
                base: ffi::sqlite3_vtab::default(),
                registry,
            },
        ))
    }

    fn best_index(&self, info: &mut IndexInfo) -> Result<()> {
        bind_parameters(
            info,
            CHUNKS_FIRST_PARAMETER,
            4,
            PARAM_SOURCE,
            "source argument is required",
        )
    }

    fn open(&'vtab mut self) -> Result<ChunksCursor<'vtab>> {
        Ok(ChunksCursor {
            base: ffi::sqlite3_vtab_cursor::default(),
            registry: self.registry.clone(),
            plan: None,
            current: None,
            phantom: PhantomData,
        })
    }
}

#[repr(C)]
struct ChunksCursor<'vtab> {
    /// Base class. Must be first
    base: ffi::sqlite3_vtab_cursor,
    registry: SharedRegistry,
    plan: Option<ChunkPlan>,
    current: Option<ChunkRow>,
    phantom: PhantomData<&'vtab ChunksTable>,
}

impl ChunksCursor<'_> {
    fn advance_to(&mut self, index: usize) -> Result<()> {
        self.current = match &self.plan {
            Some(plan) => plan
                .row(index)
                .transpose()
                .map_err(|e| module_error(e.to_string()))?,
            None => None,
        };
        Ok(())
    }
}

unsafe impl VTabCursor for ChunksCursor<'_> {
    fn filter(&mut self, idx_num: c_int, _idx_str: Option<&str>, args: &Values<'_>) -> Result<()> {
        let params = Parameters { idx_num, args };
        let model = model_for(&self.registry, params.model_name(PARAM_MODEL)?)?;
        let source = params.text(PARAM_SOURCE, "source")?;
        let options = ChunkOptions {
            chunk_size: params.count(PARAM_CHUNK_SIZE, "chunk_size")?,
            overlap: params.count(PARAM_OVERLAP, "overlap")?.unwrap_or(0),
        };

        let plan = ChunkPlan::new(model, source, &options).map_err(|e| module_error(e.to_string()))?;
        self.plan = Some(plan);
        self.advance_to(0)
    }

    fn next(&mut self) -> Result<()> {
        let next = self.current.as_ref().map_or(0, |row| row.index + 1);
        self.advance_to(next)
    }

    fn eof(&self) -> bool {
        self.current.is_none()
    }

    fn column(&self, ctx: &mut Context, i: c_int) -> Result<()> {
        let Some(row) = &self.current else {
            return Err(module_error("lembed_chunks: cursor is past the last row"));
        };
        match i {
            CHUNKS_INDEX => ctx.set_result(&(row.index as i64)),
            CHUNKS_CONTENTS => ctx.set_result(&row.text),
            CHUNKS_TOKEN_COUNT => ctx.set_result(&(row.token_count as i64)),
            CHUNKS_EMBEDDING => ctx.set_result(&row.embedding.to_bytes()),
            _ => Ok(()),
        }
    }

    fn rowid(&self) -> Result<i64> {
        Ok(self.current.as_ref().map_or(0, |row| row.index as i64))
    }
}

const BATCH_SCHEMA: &str = "CREATE TABLE x(batch_index INTEGER, contents TEXT, embedding BLOB, model HIDDEN, input HIDDEN)";

const BATCH_INDEX: c_int = 0;
const BATCH_CONTENTS: c_int = 1;
const BATCH_EMBEDDING: c_int = 2;
const BATCH_FIRST_PARAMETER: c_int = 3;

const PARAM_INPUT: c_int = 1;

#[repr(C)]
struct BatchTable {
    /// Base class. Must be first
    base: ffi::sqlite3_vtab,
    registry: SharedRegistry,
}

unsafe impl<'vtab> VTab<'vtab> for BatchTable {
    type Aux = SharedRegistry;
    type Cursor = BatchCursor<'vtab>;

    fn connect(
        _db: &mut VTabConnection,
        aux: Option<&SharedRegistry>,
        _args: &[&[u8]],
    ) -> Result<(String, Self)> {
        let registry = aux
            .cloned()
            .ok_or_else(|| module_error("lembed_batch: registry missing"))?;
        Ok((
            BATCH_SCHEMA.to_owned(),
            Self {
                base: ffi::sqlite3_vtab::default(),
                registry,
            },
        ))
    }

    fn best_index(&self, info: &mut IndexInfo) -> Result<()> {
        bind_parameters(
            info,
            BATCH_FIRST_PARAMETER,
            2,
            PARAM_INPUT,
            "input argument is required",
        )
    }

    fn open(&'vtab mut self) -> Result<BatchCursor<'vtab>> {
        Ok(BatchCursor {
            base: ffi::sqlite3_vtab_cursor::default(),
            registry: self.registry.clone(),
            plan: None,
            current: None,
            phantom: PhantomData,
        })
    }
}

#[repr(C)]
struct BatchCursor<'vtab> {
    /// Base class. Must be first
    base: ffi::sqlite3_vtab_cursor,
    registry: SharedRegistry,
    plan: Option<BatchPlan>,
    current: Option<BatchRow>,
    phantom: PhantomData<&'vtab BatchTable>,
}

impl BatchCursor<'_> {
    fn advance_to(&mut self, index: usize) -> Result<()> {
        self.current = match &self.plan {
            Some(plan) => plan
                .row(index)
                .transpose()
                .map_err(|e| module_error(e.to_string()))?,
            None => None,
        };
        Ok(())
    }
}

unsafe impl VTabCursor for BatchCursor<'_> {
    fn filter(&mut self, idx_num: c_int, _idx_str: Option<&str>, args: &Values<'_>) -> Result<()> {
        let params = Parameters { idx_num, args };
        let model = model_for(&self.registry, params.model_name(PARAM_MODEL)?)?;
        let input = params.text(PARAM_INPUT, "input")?;

        let plan = BatchPlan::from_json(model, &input).map_err(|e| module_error(e.to_string()))?;
        self.plan = Some(plan);
        self.advance_to(0)
    }

    fn next(&mut self) -> Result<()> {
        let next = self.current.as_ref().map_or(0, |row| row.index + 1);
        self.advance_to(next)
    }

    fn eof(&self) -> bool {
        self.current.is_none()
    }

    fn column(&self, ctx: &mut Context, i: c_int) -> Result<()> {
        let Some(row) = &self.current else {
            return Err(module_error("lembed_batch: cursor is past the last row"));
        };
        match i {
            BATCH_INDEX => ctx.set_result(&(row.index as i64)),
            BATCH_CONTENTS => ctx.set_result(&row.text),
            BATCH_EMBEDDING => ctx.set_result(&row.embedding.to_bytes()),
            _ => Ok(()),
        }
    }

    fn rowid(&self) -> Result<i64> {
        Ok(self.current.as_ref().map_or(0, |row| row.index as i64))
    }
}
