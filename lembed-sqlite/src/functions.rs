use std::sync::Arc;

use lembed_core::model::ModelSource;
use lembed_core::options::{ModelOptions, OptionValue, OptionsError};
use lembed_core::{EmbedError, Model, embed};
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, Error, Result};
use serde::Serialize;

use crate::{SharedRegistry, VERSION, debug_info, lock, resolve};

fn pure() -> FunctionFlags {
    FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC
}

fn stateful() -> FunctionFlags {
    FunctionFlags::SQLITE_UTF8
}

fn user_error(msg: impl Into<String>) -> Error {
    Error::UserFunctionError(msg.into().into())
}

fn embed_error(e: EmbedError) -> Error {
    Error::UserFunctionError(Box::new(e))
}

#[derive(Serialize)]
struct TokenJson {
    id: u32,
    piece: String,
}

pub(crate) fn register(conn: &Connection, registry: &SharedRegistry) -> Result<()> {
    conn.create_scalar_function("lembed_version", 0, pure(), |_| Ok(VERSION))?;
    conn.create_scalar_function("lembed_debug", 0, pure(), |_| Ok(debug_info()))?;

    conn.create_scalar_function("lembed_model_options", -1, pure(), |ctx| {
        let options = ModelOptions::from_flat(option_args(ctx)?)
            .map_err(|e| user_error(e.to_string()))?;
        Ok(options.to_json())
    })?;
    conn.create_scalar_function("lembed_context_options", -1, pure(), |ctx| {
        let options = ModelOptions::context_from_flat(option_args(ctx)?)
            .map_err(|e| user_error(e.to_string()))?;
        Ok(options.to_json())
    })?;

    for n_arg in [1, 2] {
        let r = Arc::clone(registry);
        conn.create_scalar_function("lembed", n_arg, stateful(), move |ctx| {
            let (name, text) = name_and_text(ctx)?;
            let Some(text) = text else {
                return Ok(None);
            };
            let model = resolve(&r, name.as_deref()).map_err(user_error)?;
            let embedding = embed(&model, &text).map_err(embed_error)?;
            Ok(Some(embedding.to_bytes()))
        })?;

        let r = Arc::clone(registry);
        conn.create_scalar_function("lembed_tokenize_json", n_arg, stateful(), move |ctx| {
            let (name, text) = name_and_text(ctx)?;
            let Some(text) = text else {
                return Ok(None);
            };
            let model = resolve(&r, name.as_deref()).map_err(user_error)?;
            tokenize_json(&model, &text).map(Some)
        })?;

        let r = Arc::clone(registry);
        conn.create_scalar_function("lembed_model_from_file", n_arg, stateful(), move |ctx| {
            let path: String = ctx.get(0)?;
            let options = options_arg(ctx, 1)?;
            load_handle(&r, ModelSource::path(path), &options)
        })?;

        let r = Arc::clone(registry);
        conn.create_scalar_function("lembed_model_from_bytes", n_arg, stateful(), move |ctx| {
            let bytes: Vec<u8> = ctx.get(0)?;
            let options = options_arg(ctx, 1)?;
            load_handle(&r, ModelSource::Bytes(bytes), &options)
        })?;
    }

    let r = Arc::clone(registry);
    conn.create_scalar_function("lembed_model_size", 1, stateful(), move |ctx| {
        let reference: Option<String> = ctx.get(0)?;
        let model = resolve(&r, reference.as_deref()).map_err(user_error)?;
        Ok(model.size_bytes().and_then(|size| i64::try_from(size).ok()))
    })?;

    let r = Arc::clone(registry);
    conn.create_scalar_function("lembed_token_to_piece", 2, stateful(), move |ctx| {
        let (model, id) = model_and_token(&r, ctx)?;
        match id {
            Some(id) => model.token_to_piece(id).map_err(embed_error),
            None => Ok(None),
        }
    })?;

    let r = Arc::clone(registry);
    conn.create_scalar_function("lembed_token_score", 2, stateful(), move |ctx| {
        let (model, id) = model_and_token(&r, ctx)?;
        match id {
            Some(id) => Ok(model.token_score(id).map_err(embed_error)?.map(f64::from)),
            None => Ok(None),
        }
    })?;

    Ok(())
}

/// `(text)` or `(name, text)` arguments. A NULL name means the default model.
fn name_and_text(ctx: &Context<'_>) -> Result<(Option<String>, Option<String>)> {
    if ctx.len() == 1 {
        Ok((None, ctx.get(0)?))
    } else {
        Ok((ctx.get(0)?, ctx.get(1)?))
    }
}

/// Model reference plus a token id that fits the tokenizer's id type. NULL or
/// out-of-range ids come back as `None`.
fn model_and_token(registry: &SharedRegistry, ctx: &Context<'_>) -> Result<(Arc<Model>, Option<u32>)> {
    let reference: Option<String> = ctx.get(0)?;
    let model = resolve(registry, reference.as_deref()).map_err(user_error)?;
    let id: Option<i64> = ctx.get(1)?;
    Ok((model, id.and_then(|id| u32::try_from(id).ok())))
}

fn tokenize_json(model: &Model, text: &str) -> Result<String> {
    let tokens = model.tokenize(text).map_err(embed_error)?;
    let mut out = Vec::with_capacity(tokens.len());
    for token in tokens {
        out.push(TokenJson {
            id: token.id,
            piece: model
                .token_to_piece(token.id)
                .map_err(embed_error)?
                .unwrap_or_default(),
        });
    }
    serde_json::to_string(&out).map_err(|e| user_error(format!("failed to encode tokens: {e}")))
}

/// Optional options argument: NULL or absent means defaults, text must be an
/// options object produced by `lembed_model_options`.
fn options_arg(ctx: &Context<'_>, index: usize) -> Result<ModelOptions> {
    if index >= ctx.len() {
        return Ok(ModelOptions::default());
    }
    match ctx.get_raw(index) {
        ValueRef::Null => Ok(ModelOptions::default()),
        ValueRef::Text(json) => {
            let json = std::str::from_utf8(json).map_err(|e| user_error(e.to_string()))?;
            ModelOptions::from_json(json).map_err(|e| user_error(e.to_string()))
        }
        _ => Err(user_error(
            "model options must be created with lembed_model_options()",
        )),
    }
}

fn option_args(ctx: &Context<'_>) -> Result<Vec<OptionValue>> {
    (0..ctx.len()).map(|i| option_value(ctx.get_raw(i))).collect()
}

fn option_value(value: ValueRef<'_>) -> Result<OptionValue> {
    match value {
        ValueRef::Integer(v) => Ok(OptionValue::Integer(v)),
        ValueRef::Real(v) => Ok(OptionValue::Real(v)),
        ValueRef::Text(v) => Ok(OptionValue::Text(String::from_utf8_lossy(v).into_owned())),
        ValueRef::Null | ValueRef::Blob(_) => Err(user_error(
            OptionsError::Malformed("option arguments must be integers, reals or text".into())
                .to_string(),
        )),
    }
}

fn load_handle(registry: &SharedRegistry, source: ModelSource, options: &ModelOptions) -> Result<String> {
    let mut registry = lock(registry).map_err(user_error)?;
    let model = registry.load(&source, options).map_err(embed_error)?;
    Ok(model.handle())
}
