//! format.rs — (Dé)sérialisation binaire des chunks (`.swiftmodule`).
//!
//! Tout est little-endian, écrit main (le format est figé à l'octet près).
//!
//! ```text
//! HEADER:
//!   magic[4]     = b"SWBC"
//!   version      = u32
//!   flags        = u32
//!   header_size  = u32 (= 16)
//!
//! BODY:
//!   n_consts     = u32
//!   constantes   : tag u8 puis charge
//!       0 nil
//!       1 bool    + u8
//!       2 nombre  + f64 IEEE 754 (8 octets)
//!       3 chaîne  + u32 len + octets
//!       4 objet   (placeholder ; relu comme nil)
//!       5 fonction: chaîne nom, u32 arité, u32 upvalues,
//!                   u32 taille sous-chunk, octets du sous-chunk
//!   n_code       = u32 ; octets de code
//!   n_lines      = u32 (= n_code ou 0) ; u32 par octet de code
//! ```

use thiserror::Error;

use crate::bytecode::chunk::{Chunk, Const, Function};

pub const MAGIC: [u8; 4] = *b"SWBC";
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: u32 = 16;

// Garde-fous (fichiers corrompus/malicieux)
const MAX_CONSTS: u32 = 1_000_000;
const MAX_CODE: u32 = 16 * 1024 * 1024;
const MAX_STR_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ChunkFormatError {
    #[error("mauvais magic: pas un fichier swiftlang")]
    BadMagic,
    #[error("version non supportée (attendu {expected}, trouvé {found})")]
    BadVersion { expected: u32, found: u32 },
    #[error("fichier tronqué ({0})")]
    Truncated(&'static str),
    #[error("tag de constante inconnu: {0}")]
    BadConstTag(u8),
    #[error("chaîne non UTF-8 dans le pool de constantes")]
    BadUtf8,
    #[error("taille excessive: {0}")]
    TooBig(&'static str),
    #[error("table des lignes incohérente")]
    BadLineInfo,
}

/* ───────────────────────── Écriture ───────────────────────── */

/// Sérialise un chunk complet (en-tête compris).
pub fn serialize_chunk(chunk: &Chunk) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + chunk.code.len());
    out.extend_from_slice(&MAGIC);
    write_u32(&mut out, FORMAT_VERSION);
    write_u32(&mut out, 0); // flags
    write_u32(&mut out, HEADER_SIZE);
    write_body(&mut out, chunk);
    out
}

fn write_body(out: &mut Vec<u8>, chunk: &Chunk) {
    write_u32(out, chunk.consts.len() as u32);
    for (_, c) in chunk.consts.iter() {
        match c {
            Const::Nil => out.push(0),
            Const::Bool(b) => {
                out.push(1);
                out.push(u8::from(*b));
            }
            Const::Num(x) => {
                out.push(2);
                out.extend_from_slice(&x.to_le_bytes());
            }
            Const::Str(s) => {
                out.push(3);
                write_str(out, s);
            }
            Const::Func(f) => {
                out.push(5);
                write_str(out, &f.name);
                write_u32(out, u32::from(f.arity));
                write_u32(out, u32::from(f.upvalue_count));
                let mut sub = Vec::new();
                write_body(&mut sub, &f.chunk);
                write_u32(out, sub.len() as u32);
                out.extend_from_slice(&sub);
            }
        }
    }
    write_u32(out, chunk.code.len() as u32);
    out.extend_from_slice(&chunk.code);
    if chunk.lines.len() == chunk.code.len() {
        write_u32(out, chunk.lines.len() as u32);
        for l in &chunk.lines {
            write_u32(out, *l);
        }
    } else {
        write_u32(out, 0);
    }
}

#[inline]
fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    write_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

/* ───────────────────────── Lecture ───────────────────────── */

/// Désérialise un chunk complet, en validant magic et version.
pub fn deserialize_chunk(bytes: &[u8]) -> Result<Chunk, ChunkFormatError> {
    let mut cur = Cursor::new(bytes);
    let magic = cur.take(4)?;
    if magic != MAGIC {
        return Err(ChunkFormatError::BadMagic);
    }
    let version = cur.read_u32()?;
    if version != FORMAT_VERSION {
        return Err(ChunkFormatError::BadVersion { expected: FORMAT_VERSION, found: version });
    }
    let _flags = cur.read_u32()?;
    let header_size = cur.read_u32()?;
    // tolère un en-tête étendu par une version mineure future
    if header_size > HEADER_SIZE {
        cur.take((header_size - HEADER_SIZE) as usize)?;
    }
    read_body(&mut cur)
}

fn read_body(cur: &mut Cursor<'_>) -> Result<Chunk, ChunkFormatError> {
    let mut chunk = Chunk::new();

    let n_consts = cur.read_u32()?;
    if n_consts > MAX_CONSTS {
        return Err(ChunkFormatError::TooBig("constantes"));
    }
    for _ in 0..n_consts {
        let tag = cur.read_u8()?;
        let c = match tag {
            0 => Const::Nil,
            1 => Const::Bool(cur.read_u8()? != 0),
            2 => Const::Num(f64::from_le_bytes(cur.take(8)?.try_into().expect("8 octets"))),
            3 => Const::Str(read_str(cur)?),
            // placeholder objet : relu comme nil
            4 => Const::Nil,
            5 => {
                let name = read_str(cur)?;
                let arity = cur.read_u32()?;
                let upvalue_count = cur.read_u32()?;
                let sub_len = cur.read_u32()?;
                let sub_bytes = cur.take(sub_len as usize)?;
                let mut sub_cur = Cursor::new(sub_bytes);
                let sub_chunk = read_body(&mut sub_cur)?;
                Const::Func(std::rc::Rc::new(Function {
                    name,
                    arity: arity.min(255) as u8,
                    upvalue_count: upvalue_count.min(255) as u8,
                    chunk: sub_chunk,
                    module: None,
                }))
            }
            other => return Err(ChunkFormatError::BadConstTag(other)),
        };
        // l'ordre des index est préservé : le compilateur dé-dupe les
        // chaînes à l'émission, le pool relu n'en contient pas deux égales
        chunk.add_const(c);
    }
    chunk.consts.rebuild_str_index();

    let n_code = cur.read_u32()?;
    if n_code > MAX_CODE {
        return Err(ChunkFormatError::TooBig("code"));
    }
    chunk.code = cur.take(n_code as usize)?.to_vec();

    let n_lines = cur.read_u32()?;
    if n_lines != 0 && n_lines != n_code {
        return Err(ChunkFormatError::BadLineInfo);
    }
    chunk.lines = Vec::with_capacity(n_lines as usize);
    for _ in 0..n_lines {
        chunk.lines.push(cur.read_u32()?);
    }
    Ok(chunk)
}

fn read_str(cur: &mut Cursor<'_>) -> Result<String, ChunkFormatError> {
    let len = cur.read_u32()?;
    if len > MAX_STR_LEN {
        return Err(ChunkFormatError::TooBig("chaîne"));
    }
    let bytes = cur.take(len as usize)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ChunkFormatError::BadUtf8)
}

/* ───────────────────────── Curseur LE ───────────────────────── */

struct Cursor<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ChunkFormatError> {
        if self.off + n > self.buf.len() {
            return Err(ChunkFormatError::Truncated("fin de tampon"));
        }
        let s = &self.buf[self.off..self.off + n];
        self.off += n;
        Ok(s)
    }

    fn read_u8(&mut self) -> Result<u8, ChunkFormatError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, ChunkFormatError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 octets")))
    }
}

/* ───────────────────────── Tests ───────────────────────── */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::Op;
    use std::rc::Rc;

    fn sample_chunk() -> Chunk {
        let mut inner = Function::new("helper");
        inner.arity = 2;
        inner.chunk.push_op(Op::GetLocal, 3);
        inner.chunk.push_byte(1, 3);
        inner.chunk.push_op(Op::Return, 3);

        let mut c = Chunk::new();
        let k_msg = c.add_const(Const::Str("hello".into()));
        let k_num = c.add_const(Const::Num(42.0));
        let k_t = c.add_const(Const::Bool(true));
        let k_nil = c.add_const(Const::Nil);
        let k_fn = c.add_const(Const::Func(Rc::new(inner)));
        c.push_op(Op::Constant, 1);
        c.push_byte(k_msg as u8, 1);
        c.push_op(Op::Constant, 1);
        c.push_byte(k_num as u8, 1);
        c.push_op(Op::Constant, 2);
        c.push_byte(k_t as u8, 2);
        c.push_op(Op::Constant, 2);
        c.push_byte(k_nil as u8, 2);
        c.push_op(Op::Constant, 2);
        c.push_byte(k_fn as u8, 2);
        c.push_op(Op::Return, 2);
        c
    }

    #[test]
    fn roundtrip() {
        let chunk = sample_chunk();
        let bytes = serialize_chunk(&chunk);
        assert_eq!(&bytes[0..4], b"SWBC");
        let back = deserialize_chunk(&bytes).expect("chargement ok");
        assert_eq!(back.code, chunk.code);
        assert_eq!(back.lines, chunk.lines);
        assert_eq!(back.consts.len(), chunk.consts.len());
        match (back.const_at(0), chunk.const_at(0)) {
            (Some(Const::Str(a)), Some(Const::Str(b))) => assert_eq!(a, b),
            other => panic!("constantes chaîne attendues, trouvé {other:?}"),
        }
        match back.const_at(4) {
            Some(Const::Func(f)) => {
                assert_eq!(f.name, "helper");
                assert_eq!(f.arity, 2);
                assert_eq!(f.chunk.code.len(), 3);
            }
            other => panic!("fonction attendue, trouvé {other:?}"),
        }
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = serialize_chunk(&sample_chunk());
        bytes[0] = b'X';
        assert!(matches!(deserialize_chunk(&bytes), Err(ChunkFormatError::BadMagic)));
    }

    #[test]
    fn bad_version_rejected() {
        let mut bytes = serialize_chunk(&sample_chunk());
        bytes[4] = 99;
        assert!(matches!(
            deserialize_chunk(&bytes),
            Err(ChunkFormatError::BadVersion { found: 99, .. })
        ));
    }

    #[test]
    fn truncation_rejected() {
        let bytes = serialize_chunk(&sample_chunk());
        let cut = &bytes[..bytes.len() - 3];
        assert!(matches!(deserialize_chunk(cut), Err(ChunkFormatError::Truncated(_) | ChunkFormatError::BadLineInfo)));
    }

    #[test]
    fn empty_chunk_roundtrip() {
        let chunk = Chunk::new();
        let back = deserialize_chunk(&serialize_chunk(&chunk)).expect("ok");
        assert!(back.code.is_empty());
        assert!(back.consts.is_empty());
    }
}
