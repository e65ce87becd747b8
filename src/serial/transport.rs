use std::{
    io::{self, Read, Write},
    time::Duration,
};

use serial2::SerialPort;

use super::frame::{Frame, FRAME_LEN};

/// Byte-level access to one opened serial device. Calls block for at most
/// the timeouts configured when the device was opened.
pub trait Transport: Send + 'static {
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()>;

    fn read_frame(&mut self) -> io::Result<Frame>;

    /// Drops any bytes the board sent that nobody has read yet.
    fn discard_input(&mut self) -> io::Result<()>;
}

/// Opens transports by device path.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, path: &str) -> io::Result<Box<dyn Transport>>;
}

// ---------------------------------------------------------------------------
// serial2
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SerialConnector {
    baud_rate: u32,
    timeout: Duration,
}

impl SerialConnector {
    pub fn new(baud_rate: u32, timeout: Duration) -> Self {
        Self { baud_rate, timeout }
    }
}

impl Connector for SerialConnector {
    fn open(&self, path: &str) -> io::Result<Box<dyn Transport>> {
        let mut port = SerialPort::open(path, self.baud_rate)?;
        // Some USB CDC boards only start talking once DTR/RTS are asserted.
        port.set_dtr(true)?;
        port.set_rts(true)?;
        port.set_read_timeout(self.timeout)?;
        port.set_write_timeout(self.timeout)?;
        port.discard_buffers()?;
        Ok(Box::new(port))
    }
}

impl Transport for SerialPort {
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        Write::write_all(self, frame)?;
        Write::flush(self)
    }

    fn read_frame(&mut self) -> io::Result<Frame> {
        let mut buf = [0u8; FRAME_LEN];
        Read::read_exact(self, &mut buf)?;
        Ok(buf)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.discard_input_buffer()
    }
}

// ---------------------------------------------------------------------------
// In-memory boards for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod fake {
    use std::{
        collections::{HashMap, VecDeque},
        sync::{Arc, Mutex},
    };

    use super::*;

    #[derive(Debug, Default)]
    struct BoardState {
        offline: bool,
        silent: bool,
        written: Vec<Frame>,
        pending: VecDeque<Frame>,
        scripted: VecDeque<Frame>,
    }

    /// A microcontroller that echoes every command back as its ack.
    #[derive(Debug, Clone, Default)]
    pub struct FakeBoard {
        inner: Arc<Mutex<BoardState>>,
    }

    impl FakeBoard {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn unplug(&self) {
            self.inner.lock().unwrap().offline = true;
        }

        pub fn plug_in(&self) {
            self.inner.lock().unwrap().offline = false;
        }

        /// Stop acknowledging commands.
        pub fn go_silent(&self) {
            self.inner.lock().unwrap().silent = true;
        }

        /// Answer the next command with `frame` instead of an echo.
        pub fn script_ack(&self, frame: Frame) {
            self.inner.lock().unwrap().scripted.push_back(frame);
        }

        /// Every frame written to the board so far.
        pub fn frames(&self) -> Vec<Frame> {
            self.inner.lock().unwrap().written.clone()
        }
    }

    struct FakeTransport {
        board: FakeBoard,
    }

    fn broken_pipe() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged")
    }

    impl Transport for FakeTransport {
        fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
            let mut state = self.board.inner.lock().unwrap();
            if state.offline {
                return Err(broken_pipe());
            }
            state.written.push(*frame);
            if !state.silent {
                let ack = state.scripted.pop_front().unwrap_or(*frame);
                state.pending.push_back(ack);
            }
            Ok(())
        }

        fn read_frame(&mut self) -> io::Result<Frame> {
            let mut state = self.board.inner.lock().unwrap();
            if state.offline {
                return Err(broken_pipe());
            }
            state
                .pending
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no ack"))
        }

        fn discard_input(&mut self) -> io::Result<()> {
            self.board.inner.lock().unwrap().pending.clear();
            Ok(())
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct FakeConnector {
        boards: HashMap<String, FakeBoard>,
    }

    impl FakeConnector {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_board(mut self, path: &str, board: FakeBoard) -> Self {
            self.boards.insert(path.to_owned(), board);
            self
        }
    }

    impl Connector for FakeConnector {
        fn open(&self, path: &str) -> io::Result<Box<dyn Transport>> {
            match self.boards.get(path) {
                Some(board) if !board.inner.lock().unwrap().offline => Ok(Box::new(FakeTransport {
                    board: board.clone(),
                })),
                _ => Err(io::Error::new(io::ErrorKind::NotFound, "no such device")),
            }
        }
    }
}
