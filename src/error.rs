/*
Copyright (c) 2020 Pierre Marijon <pierre@marijon.fr>

Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:

The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.

THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
 */

/* crate use */
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "Reading of the file '{filename:}' impossible, does it exist and can be read by the user?"
    )]
    CantReadFile { filename: String },

    #[error("Creation/opening of the file '{filename:}' impossible, directory in path exist? can be write by the user?")]
    CantWriteFile { filename: String },

    #[error("Error durring reading of file {filename:}")]
    ReadingError { filename: String },

    #[error("Error durring writing of file {filename:}")]
    WritingError { filename: String },

    #[error("Invalid input: {message:}")]
    InvalidInput { message: String },

    #[error("Memory or disk budget can't accommodate this input: {message:}")]
    ResourceLimit { message: String },

    #[error("No space left on device durring writing of {path:}")]
    StorageFull { path: String },

    #[error("Partition {path:} is truncated or corrupt")]
    CorruptPartition { path: String },

    #[error("Collection {path:} doesn't match the expected schema: {message:}")]
    SchemaMismatch { path: String, message: String },

    #[error("Computation cancelled")]
    Cancelled,

    #[error("Thread local aggregation is unbalanced, this is a bug, please contact the author")]
    ConcurrentStateViolation,
}

impl Error {
    /* Exit code contract: 1 user error, 2 resource or I/O error */
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidInput { .. } => 1,
            _ => 2,
        }
    }
}

pub fn from_io(e: &std::io::Error, path: &str) -> Error {
    if e.raw_os_error() == Some(28) {
        Error::StorageFull {
            path: path.to_string(),
        }
    } else {
        Error::WritingError {
            filename: path.to_string(),
        }
    }
}
