// Licensed under the Apache-2.0 license

use ota_lib::fetch::{Connection, FetchError, ImageSource, StreamError};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::PathBuf;

/// Serves an image file from the host, optionally cutting the transfer short
/// the way a dropped connection would.
pub struct FileImageSource {
    path: PathBuf,
    truncate_at: Option<u64>,
}

impl FileImageSource {
    pub fn new(path: PathBuf, truncate_at: Option<u64>) -> Self {
        FileImageSource { path, truncate_at }
    }
}

impl ImageSource for FileImageSource {
    type Connection = FileConnection;

    fn connect(&self) -> Result<FileConnection, FetchError> {
        let file = File::open(&self.path)
            .map_err(|err| FetchError::Unreachable(format!("{}: {}", self.location(), err)))?;
        let len = file
            .metadata()
            .map_err(|err| FetchError::Unreachable(err.to_string()))?
            .len();
        Ok(FileConnection {
            file,
            len,
            position: 0,
            truncate_at: self.truncate_at,
            finished: false,
        })
    }

    fn location(&self) -> String {
        format!("file://{}", self.path.display())
    }
}

pub struct FileConnection {
    file: File,
    len: u64,
    position: u64,
    truncate_at: Option<u64>,
    finished: bool,
}

impl Connection for FileConnection {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let limit = self.truncate_at.map_or(self.len, |t| t.min(self.len));
        if self.position >= limit {
            if limit < self.len {
                return Err(StreamError::Reset);
            }
            self.finished = true;
            return Ok(0);
        }
        let want = buf.len().min((limit - self.position) as usize);
        match self.file.read(&mut buf[..want]) {
            Ok(n) => {
                self.position += n as u64;
                Ok(n)
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => Ok(0),
            Err(err) => Err(StreamError::Io(err.to_string())),
        }
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.len)
    }

    fn body_finished(&self) -> bool {
        self.finished
    }
}
