//! Builder-trace serialization.
//!
//! Serialization does not persist a finished root; it records the
//! builder calls themselves, one tagged record per
//! `begin_*`/`end_*`/`emit_*`, so deserialization replays the exact
//! trace through a real [`Builder`] and reproduces the roots bit for
//! bit. Objects are assigned dense ids on first occurrence through the
//! same deduplication the constant pool uses, so an id in the stream is
//! exactly the pool index the replayed builder will compute.
//!
//! All integers are big-endian. Record tags are `i16`: negative values
//! are the control tags below, non-negative values encode an operation
//! as `(op_id << 1) | is_end`.

use crate::builder::{Builder, BuilderConfig, Label, Local};
use crate::bytecode::constant_pool::ConstantPool;
use crate::bytecode::root::RootProgram;
use std::io::{self, Read, Write};
use std::sync::Arc;
use strata_core::operation::operations;
use strata_core::{CustomOp, InterpreterModel, Source, Value};

pub const CODE_CREATE_LABEL: i16 = -2;
pub const CODE_CREATE_LOCAL: i16 = -3;
pub const CODE_CREATE_OBJECT: i16 = -4;
pub const CODE_END: i16 = -5;

/// `begin_return` record forms: with a value child, or the void
/// `emit_return` shape.
const RETURN_FORM_VALUE: u8 = 0;
const RETURN_FORM_VOID: u8 = 1;

#[inline]
fn op_tag(op_id: u16, is_end: bool) -> i16 {
    ((op_id as i16) << 1) | is_end as i16
}

// =============================================================================
// Value Codec
// =============================================================================

/// Callback pair serializing constant-pool objects.
pub trait ValueCodec {
    fn encode(&self, w: &mut dyn Write, value: &Value) -> io::Result<()>;
    fn decode(&self, r: &mut dyn Read) -> io::Result<Value>;
}

/// Codec for the built-in simple values.
#[derive(Debug, Default)]
pub struct DefaultCodec;

const VK_NULL: u8 = 0;
const VK_BOOL: u8 = 1;
const VK_INT: u8 = 2;
const VK_FLOAT: u8 = 3;
const VK_STR: u8 = 4;

impl ValueCodec for DefaultCodec {
    fn encode(&self, w: &mut dyn Write, value: &Value) -> io::Result<()> {
        match value {
            Value::Null => w.write_all(&[VK_NULL]),
            Value::Bool(b) => w.write_all(&[VK_BOOL, *b as u8]),
            Value::Int(i) => {
                w.write_all(&[VK_INT])?;
                w.write_all(&i.to_be_bytes())
            }
            Value::Float(f) => {
                w.write_all(&[VK_FLOAT])?;
                w.write_all(&f.to_bits().to_be_bytes())
            }
            Value::Str(s) => {
                w.write_all(&[VK_STR])?;
                write_str(w, s)
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("cannot serialize a {} constant", other.type_name()),
            )),
        }
    }

    fn decode(&self, r: &mut dyn Read) -> io::Result<Value> {
        let kind = read_u8(r)?;
        match kind {
            VK_NULL => Ok(Value::Null),
            VK_BOOL => Ok(Value::Bool(read_u8(r)? != 0)),
            VK_INT => {
                let mut buf = [0u8; 8];
                r.read_exact(&mut buf)?;
                Ok(Value::Int(i64::from_be_bytes(buf)))
            }
            VK_FLOAT => {
                let mut buf = [0u8; 8];
                r.read_exact(&mut buf)?;
                Ok(Value::Float(f64::from_bits(u64::from_be_bytes(buf))))
            }
            VK_STR => Ok(Value::str(read_str(r)?)),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown value kind {}", other),
            )),
        }
    }
}

// =============================================================================
// Wire Helpers
// =============================================================================

fn write_i16(w: &mut dyn Write, v: i16) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

fn write_u16(w: &mut dyn Write, v: u16) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

fn write_i32(w: &mut dyn Write, v: i32) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

fn write_str(w: &mut dyn Write, s: &str) -> io::Result<()> {
    let bytes = s.as_bytes();
    write_u16(w, bytes.len() as u16)?;
    w.write_all(bytes)
}

fn read_u8(r: &mut dyn Read) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_i16(r: &mut dyn Read) -> io::Result<i16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(i16::from_be_bytes(buf))
}

fn read_u16(r: &mut dyn Read) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_i32(r: &mut dyn Read) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

fn read_str(r: &mut dyn Read) -> io::Result<String> {
    let len = read_u16(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn invalid<T>(e: impl std::fmt::Display) -> io::Result<T> {
    Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

// =============================================================================
// Serializing Builder
// =============================================================================

/// Mirrors the builder surface, writing one record per call instead of
/// building bytecode.
pub struct SerializingBuilder<W: Write> {
    model: Arc<InterpreterModel>,
    sink: W,
    codec: Box<dyn ValueCodec>,
    pool: ConstantPool,
    next_label: u32,
    next_local: u16,
}

impl<W: Write> SerializingBuilder<W> {
    pub fn new(model: Arc<InterpreterModel>, sink: W, codec: Box<dyn ValueCodec>) -> Self {
        SerializingBuilder {
            model,
            sink,
            codec,
            pool: ConstantPool::new(),
            next_label: 0,
            next_local: strata_core::USER_LOCALS_START_IDX,
        }
    }

    /// Write the end-of-stream tag and return the sink.
    pub fn finish(mut self) -> io::Result<W> {
        write_i16(&mut self.sink, CODE_END)?;
        Ok(self.sink)
    }

    fn tag(&mut self, op_id: u16, is_end: bool) -> io::Result<()> {
        write_i16(&mut self.sink, op_tag(op_id, is_end))
    }

    /// Dense object id, emitting a `CODE_CREATE_OBJECT` record on first
    /// occurrence.
    fn object_id(&mut self, value: &Value) -> io::Result<u16> {
        let before = self.pool.len();
        let id = self.pool.add(value.clone());
        if self.pool.len() > before {
            write_i16(&mut self.sink, CODE_CREATE_OBJECT)?;
            self.codec.encode(&mut self.sink, value)?;
        }
        Ok(id)
    }

    pub fn create_label(&mut self) -> io::Result<Label> {
        write_i16(&mut self.sink, CODE_CREATE_LABEL)?;
        let id = self.next_label;
        self.next_label += 1;
        Ok(Label(id))
    }

    pub fn create_local(&mut self) -> io::Result<Local> {
        write_i16(&mut self.sink, CODE_CREATE_LOCAL)?;
        let slot = self.next_local;
        self.next_local += 1;
        Ok(Local(slot))
    }

    pub fn begin_root(&mut self, language: &str) -> io::Result<()> {
        self.next_label = 0;
        self.next_local = strata_core::USER_LOCALS_START_IDX;
        self.pool = ConstantPool::new();
        self.tag(operations::ROOT, false)?;
        write_str(&mut self.sink, language)
    }

    pub fn end_root(&mut self) -> io::Result<()> {
        self.tag(operations::ROOT, true)
    }

    pub fn begin_block(&mut self) -> io::Result<()> {
        self.tag(operations::BLOCK, false)
    }

    pub fn end_block(&mut self) -> io::Result<()> {
        self.tag(operations::BLOCK, true)
    }

    pub fn begin_if_then(&mut self) -> io::Result<()> {
        self.tag(operations::IF_THEN, false)
    }

    pub fn end_if_then(&mut self) -> io::Result<()> {
        self.tag(operations::IF_THEN, true)
    }

    pub fn begin_if_then_else(&mut self) -> io::Result<()> {
        self.tag(operations::IF_THEN_ELSE, false)
    }

    pub fn end_if_then_else(&mut self) -> io::Result<()> {
        self.tag(operations::IF_THEN_ELSE, true)
    }

    pub fn begin_conditional(&mut self) -> io::Result<()> {
        self.tag(operations::CONDITIONAL, false)
    }

    pub fn end_conditional(&mut self) -> io::Result<()> {
        self.tag(operations::CONDITIONAL, true)
    }

    pub fn begin_while(&mut self) -> io::Result<()> {
        self.tag(operations::WHILE, false)
    }

    pub fn end_while(&mut self) -> io::Result<()> {
        self.tag(operations::WHILE, true)
    }

    pub fn begin_try_catch(&mut self, exc: Local) -> io::Result<()> {
        self.tag(operations::TRY_CATCH, false)?;
        write_u16(&mut self.sink, exc.index())
    }

    pub fn end_try_catch(&mut self) -> io::Result<()> {
        self.tag(operations::TRY_CATCH, true)
    }

    pub fn begin_finally_try(&mut self, exc: Local) -> io::Result<()> {
        self.tag(operations::FINALLY_TRY, false)?;
        write_u16(&mut self.sink, exc.index())
    }

    pub fn end_finally_try(&mut self) -> io::Result<()> {
        self.tag(operations::FINALLY_TRY, true)
    }

    pub fn begin_finally_try_no_except(&mut self) -> io::Result<()> {
        self.tag(operations::FINALLY_TRY_NO_EXCEPT, false)
    }

    pub fn end_finally_try_no_except(&mut self) -> io::Result<()> {
        self.tag(operations::FINALLY_TRY_NO_EXCEPT, true)
    }

    pub fn begin_return(&mut self) -> io::Result<()> {
        self.tag(operations::RETURN, false)?;
        self.sink.write_all(&[RETURN_FORM_VALUE])
    }

    pub fn end_return(&mut self) -> io::Result<()> {
        self.tag(operations::RETURN, true)
    }

    pub fn emit_return(&mut self) -> io::Result<()> {
        self.tag(operations::RETURN, false)?;
        self.sink.write_all(&[RETURN_FORM_VOID])
    }

    pub fn begin_yield(&mut self) -> io::Result<()> {
        self.tag(operations::YIELD, false)
    }

    pub fn end_yield(&mut self) -> io::Result<()> {
        self.tag(operations::YIELD, true)
    }

    pub fn emit_label(&mut self, label: Label) -> io::Result<()> {
        self.tag(operations::LABEL, false)?;
        write_u16(&mut self.sink, label.id() as u16)
    }

    pub fn emit_branch(&mut self, label: Label) -> io::Result<()> {
        self.tag(operations::BRANCH, false)?;
        write_u16(&mut self.sink, label.id() as u16)
    }

    pub fn emit_load_constant(&mut self, value: Value) -> io::Result<()> {
        let id = self.object_id(&value)?;
        self.tag(operations::LOAD_CONSTANT, false)?;
        write_u16(&mut self.sink, id)
    }

    pub fn emit_load_argument(&mut self, index: u16) -> io::Result<()> {
        self.tag(operations::LOAD_ARGUMENT, false)?;
        write_u16(&mut self.sink, index)
    }

    pub fn emit_load_local(&mut self, local: Local) -> io::Result<()> {
        self.tag(operations::LOAD_LOCAL, false)?;
        write_u16(&mut self.sink, local.index())
    }

    pub fn begin_store_local(&mut self, local: Local) -> io::Result<()> {
        self.tag(operations::STORE_LOCAL, false)?;
        write_u16(&mut self.sink, local.index())
    }

    pub fn end_store_local(&mut self) -> io::Result<()> {
        self.tag(operations::STORE_LOCAL, true)
    }

    pub fn begin_load_local_materialized(&mut self, local: Local) -> io::Result<()> {
        self.tag(operations::LOAD_LOCAL_MAT, false)?;
        write_u16(&mut self.sink, local.index())
    }

    pub fn end_load_local_materialized(&mut self) -> io::Result<()> {
        self.tag(operations::LOAD_LOCAL_MAT, true)
    }

    pub fn begin_store_local_materialized(&mut self, local: Local) -> io::Result<()> {
        self.tag(operations::STORE_LOCAL_MAT, false)?;
        write_u16(&mut self.sink, local.index())
    }

    pub fn end_store_local_materialized(&mut self) -> io::Result<()> {
        self.tag(operations::STORE_LOCAL_MAT, true)
    }

    pub fn begin_source(&mut self, source: &Source) -> io::Result<()> {
        self.tag(operations::SOURCE, false)?;
        write_str(&mut self.sink, &source.name)?;
        match &source.contents {
            Some(contents) => {
                self.sink.write_all(&[1])?;
                write_str(&mut self.sink, contents)
            }
            None => self.sink.write_all(&[0]),
        }
    }

    pub fn end_source(&mut self) -> io::Result<()> {
        self.tag(operations::SOURCE, true)
    }

    pub fn begin_source_section(&mut self, start: i32, length: i32) -> io::Result<()> {
        self.tag(operations::SOURCE_SECTION, false)?;
        write_i32(&mut self.sink, start)?;
        write_i32(&mut self.sink, length)
    }

    pub fn end_source_section(&mut self) -> io::Result<()> {
        self.tag(operations::SOURCE_SECTION, true)
    }

    pub fn begin_tag(&mut self, tag: u16) -> io::Result<()> {
        self.tag(operations::INSTRUMENT_TAG, false)?;
        write_u16(&mut self.sink, tag)
    }

    pub fn end_tag(&mut self) -> io::Result<()> {
        self.tag(operations::INSTRUMENT_TAG, true)
    }

    pub fn begin_custom(&mut self, op: CustomOp) -> io::Result<()> {
        self.begin_custom_with_locals(op, &[])
    }

    pub fn begin_custom_with_locals(&mut self, op: CustomOp, locals: &[Local]) -> io::Result<()> {
        debug_assert!(self.model.operations.lookup(op.id()).is_some());
        self.tag(op.id(), false)?;
        write_u16(&mut self.sink, locals.len() as u16)?;
        for local in locals {
            write_u16(&mut self.sink, local.index())?;
        }
        Ok(())
    }

    pub fn end_custom(&mut self, op: CustomOp) -> io::Result<()> {
        self.tag(op.id(), true)
    }

    pub fn emit_custom(&mut self, op: CustomOp) -> io::Result<()> {
        self.begin_custom(op)?;
        self.end_custom(op)
    }
}

// =============================================================================
// Deserializer
// =============================================================================

/// Replay a serialized builder trace; roots are returned in definition
/// order so serialized cross-root references re-link by index.
pub fn deserialize<R: Read>(
    model: Arc<InterpreterModel>,
    config: BuilderConfig,
    r: &mut R,
    codec: &dyn ValueCodec,
) -> io::Result<Vec<Arc<RootProgram>>> {
    let mut builder = Builder::new(model.clone(), config);
    let mut roots = Vec::new();
    let mut objects: Vec<Value> = Vec::new();
    let mut labels: Vec<Label> = Vec::new();
    let mut locals: Vec<Local> = Vec::new();

    macro_rules! drive {
        ($call:expr) => {
            match $call {
                Ok(v) => v,
                Err(e) => return invalid(e),
            }
        };
    }

    loop {
        let tag = read_i16(r)?;
        match tag {
            CODE_END => break,
            CODE_CREATE_LABEL => labels.push(drive!(builder.create_label())),
            CODE_CREATE_LOCAL => locals.push(drive!(builder.create_local())),
            CODE_CREATE_OBJECT => objects.push(codec.decode(r)?),
            t if t >= 0 => {
                let op_id = (t >> 1) as u16;
                let is_end = (t & 1) != 0;
                replay_operation(
                    &mut builder,
                    &model,
                    r,
                    op_id,
                    is_end,
                    &mut roots,
                    &objects,
                    &mut labels,
                    &mut locals,
                )?;
            }
            bad => return invalid(format!("unknown record tag {}", bad)),
        }
    }
    Ok(roots)
}

#[allow(clippy::too_many_arguments)]
fn replay_operation<R: Read>(
    builder: &mut Builder,
    model: &Arc<InterpreterModel>,
    r: &mut R,
    op_id: u16,
    is_end: bool,
    roots: &mut Vec<Arc<RootProgram>>,
    objects: &[Value],
    labels: &mut Vec<Label>,
    locals: &mut Vec<Local>,
) -> io::Result<()> {
    macro_rules! drive {
        ($call:expr) => {
            match $call {
                Ok(v) => v,
                Err(e) => return invalid(e),
            }
        };
    }
    let label_at = |labels: &[Label], id: u16| -> io::Result<Label> {
        labels
            .get(id as usize)
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "label id out of range"))
    };
    let local_at = |locals: &[Local], idx: u16| -> io::Result<Local> {
        locals
            .iter()
            .find(|l| l.index() == idx)
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "local index out of range"))
    };

    match (op_id, is_end) {
        (operations::ROOT, false) => {
            let language = read_str(r)?;
            labels.clear();
            locals.clear();
            drive!(builder.begin_root(language));
        }
        (operations::ROOT, true) => roots.push(drive!(builder.end_root())),
        (operations::BLOCK, false) => drive!(builder.begin_block()),
        (operations::BLOCK, true) => drive!(builder.end_block()),
        (operations::IF_THEN, false) => drive!(builder.begin_if_then()),
        (operations::IF_THEN, true) => drive!(builder.end_if_then()),
        (operations::IF_THEN_ELSE, false) => drive!(builder.begin_if_then_else()),
        (operations::IF_THEN_ELSE, true) => drive!(builder.end_if_then_else()),
        (operations::CONDITIONAL, false) => drive!(builder.begin_conditional()),
        (operations::CONDITIONAL, true) => drive!(builder.end_conditional()),
        (operations::WHILE, false) => drive!(builder.begin_while()),
        (operations::WHILE, true) => drive!(builder.end_while()),
        (operations::TRY_CATCH, false) => {
            let local = local_at(locals, read_u16(r)?)?;
            drive!(builder.begin_try_catch(local));
        }
        (operations::TRY_CATCH, true) => drive!(builder.end_try_catch()),
        (operations::FINALLY_TRY, false) => {
            let local = local_at(locals, read_u16(r)?)?;
            drive!(builder.begin_finally_try(local));
        }
        (operations::FINALLY_TRY, true) => drive!(builder.end_finally_try()),
        (operations::FINALLY_TRY_NO_EXCEPT, false) => {
            drive!(builder.begin_finally_try_no_except())
        }
        (operations::FINALLY_TRY_NO_EXCEPT, true) => drive!(builder.end_finally_try_no_except()),
        (operations::RETURN, false) => match read_u8(r)? {
            RETURN_FORM_VALUE => drive!(builder.begin_return()),
            _ => drive!(builder.emit_return()),
        },
        (operations::RETURN, true) => drive!(builder.end_return()),
        (operations::YIELD, false) => drive!(builder.begin_yield()),
        (operations::YIELD, true) => drive!(builder.end_yield()),
        (operations::LABEL, false) => {
            let label = label_at(labels, read_u16(r)?)?;
            drive!(builder.emit_label(label));
        }
        (operations::BRANCH, false) => {
            let label = label_at(labels, read_u16(r)?)?;
            drive!(builder.emit_branch(label));
        }
        (operations::LOAD_CONSTANT, false) => {
            let id = read_u16(r)? as usize;
            let value = objects
                .get(id)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "object id out of range"))?;
            drive!(builder.emit_load_constant(value));
        }
        (operations::LOAD_ARGUMENT, false) => {
            let index = read_u16(r)?;
            drive!(builder.emit_load_argument(index));
        }
        (operations::LOAD_LOCAL, false) => {
            let local = local_at(locals, read_u16(r)?)?;
            drive!(builder.emit_load_local(local));
        }
        (operations::STORE_LOCAL, false) => {
            let local = local_at(locals, read_u16(r)?)?;
            drive!(builder.begin_store_local(local));
        }
        (operations::STORE_LOCAL, true) => drive!(builder.end_store_local()),
        (operations::LOAD_LOCAL_MAT, false) => {
            let local = local_at(locals, read_u16(r)?)?;
            drive!(builder.begin_load_local_materialized(local));
        }
        (operations::LOAD_LOCAL_MAT, true) => drive!(builder.end_load_local_materialized()),
        (operations::STORE_LOCAL_MAT, false) => {
            let local = local_at(locals, read_u16(r)?)?;
            drive!(builder.begin_store_local_materialized(local));
        }
        (operations::STORE_LOCAL_MAT, true) => drive!(builder.end_store_local_materialized()),
        (operations::SOURCE, false) => {
            let name = read_str(r)?;
            let source = match read_u8(r)? {
                0 => Source::new(name),
                _ => Source::with_contents(name, read_str(r)?),
            };
            drive!(builder.begin_source(source));
        }
        (operations::SOURCE, true) => drive!(builder.end_source()),
        (operations::SOURCE_SECTION, false) => {
            let start = read_i32(r)?;
            let length = read_i32(r)?;
            drive!(builder.begin_source_section(start, length));
        }
        (operations::SOURCE_SECTION, true) => drive!(builder.end_source_section()),
        (operations::INSTRUMENT_TAG, false) => {
            let tag = read_u16(r)?;
            drive!(builder.begin_tag(tag));
        }
        (operations::INSTRUMENT_TAG, true) => drive!(builder.end_tag()),
        (custom, false) if custom >= operations::FIRST_CUSTOM => {
            if model.operations.lookup(custom).is_none() {
                return invalid(format!("unknown custom operation {}", custom));
            }
            let count = read_u16(r)? as usize;
            let mut ls = Vec::with_capacity(count);
            for _ in 0..count {
                ls.push(local_at(locals, read_u16(r)?)?);
            }
            drive!(builder.begin_custom_with_locals(CustomOp::from_id(custom), &ls));
        }
        (custom, true) if custom >= operations::FIRST_CUSTOM => {
            if model.operations.lookup(custom).is_none() {
                return invalid(format!("unknown custom operation {}", custom));
            }
            drive!(builder.end_custom(CustomOp::from_id(custom)));
        }
        (other, _) => return invalid(format!("unknown operation id {}", other)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::InterpreterDef;

    fn model() -> Arc<InterpreterModel> {
        InterpreterDef::new("ser-test").build()
    }

    #[test]
    fn test_round_trip_simple_return() {
        let model = model();
        let mut direct = Builder::new(model.clone(), BuilderConfig::default());
        direct.begin_root("demo").unwrap();
        direct.begin_return().unwrap();
        direct.emit_load_constant(Value::Int(7)).unwrap();
        direct.end_return().unwrap();
        let expected = direct.end_root().unwrap();

        let mut ser =
            SerializingBuilder::new(model.clone(), Vec::new(), Box::new(DefaultCodec));
        ser.begin_root("demo").unwrap();
        ser.begin_return().unwrap();
        ser.emit_load_constant(Value::Int(7)).unwrap();
        ser.end_return().unwrap();
        ser.end_root().unwrap();
        let bytes = ser.finish().unwrap();

        let roots = deserialize(
            model,
            BuilderConfig::default(),
            &mut bytes.as_slice(),
            &DefaultCodec,
        )
        .unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].bytecode_snapshot(), expected.bytecode_snapshot());
        assert_eq!(roots[0].constants(), expected.constants());
        assert_eq!(roots[0].handlers_flat(), expected.handlers_flat());
    }

    #[test]
    fn test_object_ids_are_dense_and_deduplicated() {
        let model = model();
        let mut ser = SerializingBuilder::new(model, Vec::new(), Box::new(DefaultCodec));
        ser.begin_root("demo").unwrap();
        ser.begin_block().unwrap();
        ser.emit_load_constant(Value::Int(1)).unwrap();
        ser.emit_load_constant(Value::Int(1)).unwrap();
        ser.emit_load_constant(Value::Int(2)).unwrap();
        ser.end_block().unwrap();
        ser.end_root().unwrap();
        let bytes = ser.finish().unwrap();
        // Exactly two CODE_CREATE_OBJECT records for the two distinct
        // constants.
        let count = bytes
            .windows(2)
            .filter(|w| i16::from_be_bytes([w[0], w[1]]) == CODE_CREATE_OBJECT)
            .count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let model = model();
        let bytes = (-9i16).to_be_bytes().to_vec();
        let err = deserialize(
            model,
            BuilderConfig::default(),
            &mut bytes.as_slice(),
            &DefaultCodec,
        )
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
