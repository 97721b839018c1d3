//! File formats: raw height buffers and OBJ meshes.
//!
//! Height buffer: `N*N` little-endian `u16` samples, row-major, no header.
//! Mesh: text OBJ with `v x y z` lines followed by 1-based `f a b c` lines.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{Result, TerrainError};
use crate::mesh::GridMesh;

const SAMPLE_BYTES: usize = std::mem::size_of::<u16>();

/// Write `samples` as a raw little-endian height buffer.
pub fn write_height_buffer(path: &Path, samples: &[u16]) -> Result<()> {
    let mut bytes = Vec::with_capacity(samples.len() * SAMPLE_BYTES);
    for &s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    fs::write(path, bytes)
        .map_err(|e| TerrainError::io(format!("write height buffer {}", path.display()), e))
}

/// Read exactly `edge * edge` samples from a raw height buffer.
///
/// Trailing bytes past the declared size are ignored.
pub fn read_height_buffer(path: &Path, edge: u32) -> Result<Vec<u16>> {
    let expected = edge as usize * edge as usize;
    let bytes = fs::read(path)
        .map_err(|e| TerrainError::io(format!("read height buffer {}", path.display()), e))?;

    let available = bytes.len() / SAMPLE_BYTES;
    if available < expected {
        return Err(TerrainError::TruncatedHeightBuffer {
            path: path.to_path_buf(),
            expected,
            actual: available,
        });
    }

    Ok(decode_samples(&bytes[..expected * SAMPLE_BYTES]))
}

/// Read a height buffer whose edge length is inferred from the file size.
pub fn read_height_buffer_square(path: &Path) -> Result<(u32, Vec<u16>)> {
    let bytes = fs::read(path)
        .map_err(|e| TerrainError::io(format!("read height buffer {}", path.display()), e))?;

    let samples = bytes.len() / SAMPLE_BYTES;
    let edge = (samples as f64).sqrt().round() as usize;
    if bytes.len() % SAMPLE_BYTES != 0 || samples == 0 || edge * edge != samples {
        return Err(TerrainError::NotSquare {
            path: path.to_path_buf(),
            samples,
        });
    }

    Ok((edge as u32, decode_samples(&bytes)))
}

fn decode_samples(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(SAMPLE_BYTES)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Serialize a mesh as an OBJ file.
pub fn write_obj(path: &Path, mesh: &GridMesh) -> Result<()> {
    let context = || format!("write mesh {}", path.display());
    let file = File::create(path).map_err(|e| TerrainError::io(context(), e))?;
    let mut out = BufWriter::new(file);

    write_obj_to(&mut out, mesh)
        .and_then(|_| out.flush())
        .map_err(|e| TerrainError::io(context(), e))
}

fn write_obj_to<W: Write>(out: &mut W, mesh: &GridMesh) -> std::io::Result<()> {
    for [x, y, z] in &mesh.vertices {
        writeln!(out, "v {} {} {}", x, y, z)?;
    }
    // OBJ indices are 1-based
    for tri in mesh.indices.chunks_exact(3) {
        writeln!(out, "f {} {} {}", tri[0] + 1, tri[1] + 1, tri[2] + 1)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_height_buffer_roundtrip() {
        let dir = tempdir().unwrap();
        for edge in [1u32, 2, 3, 16, 256] {
            let samples: Vec<u16> = (0..edge * edge).map(|i| (i * 257 % 65536) as u16).collect();
            let path = dir.path().join(format!("lod_{edge}.height.raw"));
            write_height_buffer(&path, &samples).unwrap();
            assert_eq!(read_height_buffer(&path, edge).unwrap(), samples);
        }
    }

    #[test]
    fn test_height_buffer_is_little_endian() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("le.height.raw");
        write_height_buffer(&path, &[0x1234, 0xABCD]).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![0x34, 0x12, 0xCD, 0xAB]);
    }

    #[test]
    fn test_truncated_height_buffer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.height.raw");
        write_height_buffer(&path, &[1, 2, 3]).unwrap();
        match read_height_buffer(&path, 2) {
            Err(TerrainError::TruncatedHeightBuffer { expected, actual, .. }) => {
                assert_eq!((expected, actual), (4, 3));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_missing_height_buffer() {
        let err = read_height_buffer(Path::new("nope/lod0.height.raw"), 4).unwrap_err();
        assert!(matches!(err, TerrainError::Io { .. }));
        assert!(err.to_string().contains("nope/lod0.height.raw"));
    }

    #[test]
    fn test_square_inference() {
        let dir = tempdir().unwrap();
        let square = dir.path().join("square.height.raw");
        write_height_buffer(&square, &[5; 64 * 64]).unwrap();
        let (edge, samples) = read_height_buffer_square(&square).unwrap();
        assert_eq!(edge, 64);
        assert_eq!(samples.len(), 4096);

        let oblong = dir.path().join("oblong.height.raw");
        write_height_buffer(&oblong, &[5; 12]).unwrap();
        assert!(matches!(
            read_height_buffer_square(&oblong),
            Err(TerrainError::NotSquare { samples: 12, .. })
        ));

        let empty = dir.path().join("empty.height.raw");
        write_height_buffer(&empty, &[]).unwrap();
        assert!(read_height_buffer_square(&empty).is_err());
    }

    #[test]
    fn test_obj_layout() {
        let mesh = GridMesh {
            vertices: vec![[0.0, 0.0, 0.0], [1.0, 10.0, 0.0], [0.0, 10.0, 1.0], [1.0, 0.0, 1.0]],
            indices: vec![0, 2, 1, 1, 2, 3],
        };
        let mut out = Vec::new();
        write_obj_to(&mut out, &mesh).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "v 0 0 0",
                "v 1 10 0",
                "v 0 10 1",
                "v 1 0 1",
                "f 1 3 2",
                "f 2 3 4",
            ]
        );
    }
}
