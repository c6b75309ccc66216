//! bytecode — Format binaire exécutable : opcodes, Chunk, (dé)sérialisation.

pub mod chunk;
pub mod disasm;
pub mod format;
pub mod op;

pub use chunk::{Chunk, Const, ConstPool, Function};
pub use format::{deserialize_chunk, serialize_chunk, ChunkFormatError};
pub use op::{Op, OperandKind};
