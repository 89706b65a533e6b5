/*!
Streaming compression for backup files.

Backups are written through a compressing sink that never seeks, so they can
be produced into pipes. Readers sniff the gzip magic bytes and decompress
transparently, which keeps plain and compressed backups interchangeable.
*/

use flate2::{read::MultiGzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};
use std::io::{self, Chain, Cursor, Read, Write};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Compression applied to a backup stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Plain newline-delimited JSON
    None,
    /// Gzip (DEFLATE) with the default level
    #[default]
    Gzip,
}

impl Compression {
    /// Get the name of the compression algorithm
    pub fn algorithm_name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
        }
    }

    /// Wrap a writer so that everything written through it is compressed
    pub fn writer<W: Write>(&self, inner: W) -> CompressedWriter<W> {
        match self {
            Compression::None => CompressedWriter::Plain(inner),
            Compression::Gzip => {
                CompressedWriter::Gzip(GzEncoder::new(inner, flate2::Compression::default()))
            }
        }
    }
}

/// Writer half of a backup stream
pub enum CompressedWriter<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
}

impl<W: Write> CompressedWriter<W> {
    /// Finish the compressed stream and hand back the inner writer
    pub fn finish(self) -> io::Result<W> {
        match self {
            CompressedWriter::Plain(mut inner) => {
                inner.flush()?;
                Ok(inner)
            }
            CompressedWriter::Gzip(encoder) => encoder.finish(),
        }
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressedWriter::Plain(inner) => inner.write(buf),
            CompressedWriter::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressedWriter::Plain(inner) => inner.flush(),
            CompressedWriter::Gzip(encoder) => encoder.flush(),
        }
    }
}

type Sniffed<R> = Chain<Cursor<Vec<u8>>, R>;

/// Reader half of a backup stream
pub enum CompressedReader<R: Read> {
    Plain(Sniffed<R>),
    Gzip(Box<MultiGzDecoder<Sniffed<R>>>),
}

impl<R: Read> CompressedReader<R> {
    /// Inspect the first bytes of `reader` and pick the matching decompressor
    ///
    /// The inspected bytes are replayed, so nothing is consumed from the
    /// logical stream and no seeking is required.
    pub fn detect(mut reader: R) -> io::Result<Self> {
        let mut magic = [0u8; 2];
        let mut filled = 0;
        while filled < magic.len() {
            let n = match reader.read(&mut magic[filled..]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if n == 0 {
                break;
            }
            filled += n;
        }

        let replay = Cursor::new(magic[..filled].to_vec()).chain(reader);
        if filled == magic.len() && magic == GZIP_MAGIC {
            Ok(CompressedReader::Gzip(Box::new(MultiGzDecoder::new(replay))))
        } else {
            Ok(CompressedReader::Plain(replay))
        }
    }

    pub fn compression(&self) -> Compression {
        match self {
            CompressedReader::Plain(_) => Compression::None,
            CompressedReader::Gzip(_) => Compression::Gzip,
        }
    }
}

impl<R: Read> Read for CompressedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            CompressedReader::Plain(inner) => inner.read(buf),
            CompressedReader::Gzip(decoder) => decoder.read(buf),
        }
    }
}
