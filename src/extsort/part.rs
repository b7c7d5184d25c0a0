//! Spilled parts: sorted chunks written to temporary files and read back lazily.

use bincode::{Decode, Encode};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};
use std::cmp::Ordering;
use std::error::Error;
use std::fmt::{self, Display};
use std::fs::File;
use std::io::prelude::*;
use std::io::{self, BufReader, BufWriter};
use std::marker::PhantomData;
use std::path::Path;
use tempfile::TempPath;

/// Part error
#[derive(Debug)]
pub enum PartError {
    /// The backing file could not be allocated.
    Resource(io::Error),
    /// Common I/O error.
    IO(io::Error),
    /// Data serialization error.
    Encode(bincode::error::EncodeError),
    /// Data deserialization error.
    Decode(bincode::error::DecodeError),
    /// The part was fully read and its backing file no longer exists.
    ExhaustedSequence,
}

impl From<io::Error> for PartError {
    fn from(err: io::Error) -> Self {
        PartError::IO(err)
    }
}

impl From<bincode::error::EncodeError> for PartError {
    fn from(err: bincode::error::EncodeError) -> Self {
        PartError::Encode(err)
    }
}

impl From<bincode::error::DecodeError> for PartError {
    fn from(err: bincode::error::DecodeError) -> Self {
        PartError::Decode(err)
    }
}

impl Error for PartError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PartError::Resource(err) => Some(err),
            PartError::IO(err) => Some(err),
            PartError::Encode(err) => Some(err),
            PartError::Decode(err) => Some(err),
            PartError::ExhaustedSequence => None,
        }
    }
}

impl Display for PartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartError::Resource(err) => write!(f, "part file not created: {}", err),
            PartError::IO(err) => write!(f, "{}", err),
            PartError::Encode(err) => write!(f, "{}", err),
            PartError::Decode(err) => write!(f, "{}", err),
            PartError::ExhaustedSequence => write!(f, "part already consumed"),
        }
    }
}

/// A sorted chunk spilled to a uniquely named temporary file.
///
/// The file is owned by the part: dropping the part, or the [`PartReader`]
/// it turns into, removes it.
pub struct Part<T> {
    file: File,
    path: TempPath,
    len: usize,
    bytes: u64,
    item_type: PhantomData<T>,
}

impl<T> Part<T>
where
    T: Encode,
{
    /// Sorts the chunk with `cmp` and dumps it to a new file in `dir`.
    ///
    /// The sort is stable. If any item fails to encode, the partially written
    /// file is removed before the error is returned.
    ///
    /// # Arguments
    /// * `dir` - Directory the part file is created in
    /// * `chunk` - Items to be sorted and dumped to the part
    /// * `cmp` - Item ordering
    pub fn spill<F>(dir: &Path, mut chunk: Vec<T>, cmp: F) -> Result<Self, PartError>
    where
        F: Fn(&T, &T) -> Ordering,
    {
        chunk.sort_by(cmp);
        Self::from_sorted(dir, chunk)
    }

    /// Dumps items that are already in order.
    pub(crate) fn from_sorted(dir: &Path, items: Vec<T>) -> Result<Self, PartError> {
        let tmp_file = tempfile::Builder::new()
            .prefix("part-")
            .suffix(".spill")
            .tempfile_in(dir)
            .map_err(PartError::Resource)?;
        let (file, path) = tmp_file.into_parts();

        let len = items.len();
        let mut writer = BufWriter::new(file);
        let bytes = dump(&mut writer, items)?;
        let mut file = writer
            .into_inner()
            .map_err(|err| PartError::IO(err.into_error()))?;
        file.rewind()?;

        debug!("spilled {} items ({} bytes) to {}", len, bytes, path.display());
        Ok(Self {
            file,
            path,
            len,
            bytes,
            item_type: PhantomData,
        })
    }
}

impl<T> Part<T> {
    /// Number of items in the part.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the backing file in bytes.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Turns the part into a lazy reader over its items.
    pub fn into_reader(self) -> PartReader<T> {
        PartReader {
            reader: Some(BufReader::new(self.file)),
            path: Some(self.path),
            remaining: self.len,
            len: self.len,
            bytes: self.bytes,
            buf: Vec::new(),
            item_type: PhantomData,
        }
    }
}

fn dump<T: Encode, W: Write>(
    writer: &mut W,
    items: impl IntoIterator<Item = T>,
) -> Result<u64, PartError> {
    let config = bincode::config::standard();
    let mut buf = Vec::new();
    let mut bytes = 0;
    for item in items.into_iter() {
        buf.clear();
        bincode::encode_into_std_write(&item, &mut buf, config)?;
        writer.write_u64::<LittleEndian>(buf.len() as u64)?;
        writer.write_all(&buf)?;
        bytes += 8 + buf.len() as u64;
    }
    writer.flush()?;
    Ok(bytes)
}

/// Reads the items of a [`Part`] back in order.
///
/// The backing file is removed as soon as the last item has been read, when a
/// read fails, or when the reader is dropped, whichever comes first.
pub struct PartReader<T> {
    reader: Option<BufReader<File>>,
    path: Option<TempPath>,
    remaining: usize,
    len: usize,
    bytes: u64,
    buf: Vec<u8>,
    item_type: PhantomData<T>,
}

impl<T> PartReader<T> {
    /// Path of the backing file, or `None` once it has been removed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Rewinds to the first item.
    ///
    /// Fails with [`PartError::ExhaustedSequence`] once the backing file is gone.
    pub fn restart(&mut self) -> Result<(), PartError> {
        match (self.reader.as_mut(), self.path.as_ref()) {
            (Some(reader), Some(_)) => {
                reader.rewind()?;
                self.remaining = self.len;
                Ok(())
            }
            _ => Err(PartError::ExhaustedSequence),
        }
    }

    fn finish(&mut self) {
        self.remaining = 0;
        // Close the handle first so removal also works where open files are locked.
        self.reader = None;
        if let Some(path) = self.path.take() {
            let display = path.display().to_string();
            match path.close() {
                Ok(()) => debug!("removed part {}", display),
                Err(err) => warn!("failed to remove part {}: {}", display, err),
            }
        }
    }
}

impl<T> PartReader<T>
where
    T: Decode<()>,
{
    fn read_item(&mut self) -> Result<T, PartError> {
        let reader = self.reader.as_mut().ok_or(PartError::ExhaustedSequence)?;
        let length = reader.read_u64::<LittleEndian>()?;
        // A record can never be larger than the part it was written to.
        if length > self.bytes {
            return Err(PartError::IO(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record of {} bytes in a part of {} bytes", length, self.bytes),
            )));
        }
        let length = length as usize;
        self.buf.resize(length, 0);
        reader.read_exact(&mut self.buf)?;

        let config = bincode::config::standard();
        let (item, n) = bincode::decode_from_slice(&self.buf, config)?;
        if n != length {
            return Err(PartError::IO(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Expected {} bytes, got {}", length, n),
            )));
        }
        Ok(item)
    }
}

impl<T> Iterator for PartReader<T>
where
    T: Decode<()>,
{
    type Item = Result<T, PartError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            self.finish();
            return None;
        }
        match self.read_item() {
            Ok(item) => {
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.finish();
                }
                Some(Ok(item))
            }
            Err(err) => {
                self.finish();
                Some(Err(err))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T> ExactSizeIterator for PartReader<T> where T: Decode<()> {}

#[cfg(test)]
mod test {
    use bincode::enc::Encoder;
    use bincode::error::EncodeError;
    use bincode::{Decode, Encode};
    use rand::seq::SliceRandom;
    use rstest::*;

    use super::{Part, PartError};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn is_empty_dir(dir: &tempfile::TempDir) -> bool {
        std::fs::read_dir(dir.path()).unwrap().next().is_none()
    }

    #[derive(Debug, Clone, PartialEq, Encode, Decode)]
    struct Keyed {
        key: u32,
        tag: u32,
    }

    struct Poison(u32);

    impl Encode for Poison {
        fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
            if self.0 == 13 {
                Err(EncodeError::Other("unlucky item"))
            } else {
                self.0.encode(encoder)
            }
        }
    }

    #[rstest]
    fn test_part_round_trip(tmp_dir: tempfile::TempDir) {
        let mut input: Vec<i32> = Vec::from_iter(0..100);
        input.shuffle(&mut rand::thread_rng());

        let part = Part::spill(tmp_dir.path(), input, |a: &i32, b: &i32| a.cmp(b)).unwrap();
        assert_eq!(part.len(), 100);
        assert!(part.bytes() > 0);
        let path = part.path().to_path_buf();
        assert!(path.exists());

        let reader = part.into_reader();
        assert_eq!(reader.len(), 100);
        let restored: Vec<i32> = reader.collect::<Result<_, _>>().unwrap();

        assert_eq!(restored, Vec::from_iter(0..100));
        assert!(!path.exists());
        assert!(is_empty_dir(&tmp_dir));
    }

    #[rstest]
    fn test_spill_is_stable(tmp_dir: tempfile::TempDir) {
        let input = vec![
            Keyed { key: 2, tag: 0 },
            Keyed { key: 1, tag: 1 },
            Keyed { key: 2, tag: 2 },
            Keyed { key: 1, tag: 3 },
        ];
        let part = Part::spill(tmp_dir.path(), input, |a: &Keyed, b: &Keyed| a.key.cmp(&b.key))
            .unwrap();
        let tags: Vec<u32> = part
            .into_reader()
            .map(|x| x.unwrap().tag)
            .collect();
        assert_eq!(tags, vec![1, 3, 0, 2]);
    }

    #[rstest]
    fn test_drop_removes_file(tmp_dir: tempfile::TempDir) {
        let part = Part::spill(tmp_dir.path(), vec![3u64, 2, 1], u64::cmp).unwrap();
        let mut reader = part.into_reader();
        assert_eq!(reader.next().unwrap().unwrap(), 1);
        assert!(!is_empty_dir(&tmp_dir));
        drop(reader);
        assert!(is_empty_dir(&tmp_dir));

        let part = Part::spill(tmp_dir.path(), vec![1u64], u64::cmp).unwrap();
        drop(part);
        assert!(is_empty_dir(&tmp_dir));
    }

    #[rstest]
    fn test_restart(tmp_dir: tempfile::TempDir) {
        let part = Part::spill(tmp_dir.path(), vec![4u8, 1, 3, 2], u8::cmp).unwrap();
        let mut reader = part.into_reader();
        assert_eq!(reader.next().unwrap().unwrap(), 1);
        assert_eq!(reader.next().unwrap().unwrap(), 2);

        reader.restart().unwrap();
        assert_eq!(reader.len(), 4);
        let all: Vec<u8> = reader.by_ref().collect::<Result<_, _>>().unwrap();
        assert_eq!(all, vec![1, 2, 3, 4]);

        assert!(reader.path().is_none());
        assert!(reader.next().is_none());
        assert!(matches!(reader.restart(), Err(PartError::ExhaustedSequence)));
    }

    #[rstest]
    fn test_encode_error_removes_file(tmp_dir: tempfile::TempDir) {
        let input = vec![Poison(1), Poison(13), Poison(2)];
        let result = Part::spill(tmp_dir.path(), input, |a: &Poison, b: &Poison| a.0.cmp(&b.0));
        assert!(matches!(result, Err(PartError::Encode(_))));
        assert!(is_empty_dir(&tmp_dir));
    }

    #[rstest]
    fn test_missing_dir_is_resource_error(tmp_dir: tempfile::TempDir) {
        let missing = tmp_dir.path().join("missing");
        let result = Part::spill(&missing, vec![1u32, 2], u32::cmp);
        assert!(matches!(result, Err(PartError::Resource(_))));
        assert!(!missing.exists());
    }

    #[rstest]
    fn test_oversized_record_length(tmp_dir: tempfile::TempDir) {
        let part = Part::spill(tmp_dir.path(), vec![7u64, 8], u64::cmp).unwrap();
        std::fs::write(part.path(), (u64::MAX / 2).to_le_bytes()).unwrap();

        let mut reader = part.into_reader();
        match reader.next() {
            Some(Err(PartError::IO(err))) => {
                assert_eq!(err.kind(), std::io::ErrorKind::InvalidData)
            }
            _ => panic!("expected an invalid data error"),
        }
        assert!(reader.next().is_none());
        assert!(is_empty_dir(&tmp_dir));
    }

    #[rstest]
    fn test_decode_error_removes_file(tmp_dir: tempfile::TempDir) {
        let part = Part::spill(tmp_dir.path(), vec!["a".to_string()], String::cmp).unwrap();
        // Length prefix 2, then a one-byte string holding invalid UTF-8.
        let mut corrupt = 2u64.to_le_bytes().to_vec();
        corrupt.extend_from_slice(&[1, 0xFF]);
        std::fs::write(part.path(), corrupt).unwrap();

        let mut reader = part.into_reader();
        assert!(matches!(reader.next(), Some(Err(PartError::Decode(_)))));
        assert!(reader.next().is_none());
        assert!(is_empty_dir(&tmp_dir));
    }
}
