use std::io::{self, prelude::*};

/// Compute the log-base-two of the next power of two: 8 -> 3, 9 -> 4.
///
pub fn ceil_log2(x: usize) -> usize {
    let mut n = 0;
    while 1 << n < x {
        n += 1
    }
    n
}

/// Determine whether an I/O error is a read or write timeout, as opposed to
/// a broken connection.
///
pub fn is_timeout(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Read a usize out of the given stream.
///
pub fn read_usize<R: Read>(stream: &mut R) -> io::Result<usize> {
    Ok(usize::from_le_bytes(read_bytes_array(stream)?))
}

/// Read the given (const) number of bytes from a stream, into an array.
///
pub fn read_bytes_array<R: Read, const SIZE: usize>(stream: &mut R) -> io::Result<[u8; SIZE]> {
    let mut buffer = [0; SIZE];
    read_bytes_into(stream, &mut buffer)?;
    Ok(buffer)
}

/// Fill up the given buffer by reading bytes from a stream. A timeout before
/// the first byte is returned to the caller; once a message has started,
/// timeouts are waited out so the stream stays aligned on message
/// boundaries.
///
pub fn read_bytes_into<R: Read>(stream: &mut R, buffer: &mut [u8]) -> io::Result<()> {
    fill_buffer(stream, buffer, |cursor| cursor > 0)
}

/// Read the given number of bytes from a stream, into a vec, for a message
/// whose header has already been consumed. Timeouts are waited out for as
/// long as `keep_waiting` returns true, including before the first byte.
///
pub fn read_payload<R, F>(stream: &mut R, size: usize, keep_waiting: F) -> io::Result<Vec<u8>>
where
    R: Read,
    F: Fn() -> bool,
{
    let mut buffer = vec![0; size];
    fill_buffer(stream, &mut buffer, |_| keep_waiting())?;
    Ok(buffer)
}

fn fill_buffer<R, F>(stream: &mut R, buffer: &mut [u8], wait_out_timeout: F) -> io::Result<()>
where
    R: Read,
    F: Fn(usize) -> bool,
{
    let mut cursor = 0;
    while cursor < buffer.len() {
        match stream.read(&mut buffer[cursor..]) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed")),
            Ok(n) => cursor += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if is_timeout(&e) && wait_out_timeout(cursor) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
