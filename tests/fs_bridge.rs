use hy_hello::fs::DEFAULT_CREATE_MODE;
use hy_hello::protocol::{
    Envelope, FsOp, GuestMode, GuestOpenFlags, GuestWhence, OpenRequest, ReadRequest, Record,
    SeekRequest, WriteRequest, FS_PORT, MAX_DATA, MODE_UNSPECIFIED,
};
use hy_hello::{Dispatcher, ExitReason, GuestMemory};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const MEMORY_SIZE: usize = 0x10000;

const ENVELOPE: i64 = 0x100;
const PAYLOAD: i64 = 0x200;
const PATHNAME: i64 = 0x300;
const BUFFER: i64 = 0x1000;

/// Stored in result fields beforehand, to tell whether the host wrote anything back.
const UNTOUCHED: i32 = 0x7777;

struct Guest<'a> {
    dispatcher: Dispatcher<'a, Vec<u8>>,
}

impl<'a> Guest<'a> {
    fn new(memory: &'a mut GuestMemory) -> Self {
        Self {
            dispatcher: Dispatcher::new(memory, Vec::new()),
        }
    }

    fn memory(&mut self) -> &mut GuestMemory {
        self.dispatcher.memory_mut()
    }

    fn notify(&mut self, offset: u32) {
        let data = offset.to_le_bytes();

        self.dispatcher
            .handle_exit(ExitReason::IoOut { port: FS_PORT, data: &data })
            .unwrap();
    }

    fn submit(&mut self, op: i32, fd: i32, payload: impl Record) -> Envelope {
        let envelope = Envelope { op, fd, flag: UNTOUCHED, payload: PAYLOAD as u32 };

        self.memory().write_obj(ENVELOPE, envelope).unwrap();
        self.memory().write_obj(PAYLOAD, payload).unwrap();
        self.notify(ENVELOPE as u32);

        Envelope::read_from(self.memory(), ENVELOPE).unwrap()
    }

    fn open_at(&mut self, pathname: u32, flags: GuestOpenFlags, mode: i32) -> i32 {
        let request = OpenRequest { flags: flags.bits() as i32, pathname, mode, fd: UNTOUCHED };

        self.submit(FsOp::Open as i32, 0, request);

        OpenRequest::read_from(self.memory(), PAYLOAD).unwrap().fd
    }

    fn open(&mut self, path: &Path, flags: GuestOpenFlags, mode: i32) -> i32 {
        let mut bytes = path.to_str().unwrap().as_bytes().to_vec();
        bytes.push(0);

        self.memory().write(PATHNAME, &bytes).unwrap();
        self.open_at(PATHNAME as u32, flags, mode)
    }

    fn read(&mut self, fd: i32, size: u32) -> (i32, Vec<u8>) {
        let request = ReadRequest { fd, size, buf: BUFFER as u32, ssize: UNTOUCHED };

        self.submit(FsOp::Read as i32, 0, request);

        let ssize = ReadRequest::read_from(self.memory(), PAYLOAD).unwrap().ssize;
        let data = if ssize > 0 {
            self.memory().read_vec(BUFFER, ssize as usize).unwrap()
        } else {
            vec![]
        };

        (ssize, data)
    }

    /// Returns the result and the count as left in the request.
    fn write(&mut self, fd: i32, bytes: &[u8], count: u32) -> (i32, u32) {
        self.memory().write(BUFFER, bytes).unwrap();

        let request = WriteRequest { fd, buf: BUFFER as u32, count, ssize: UNTOUCHED };

        self.submit(FsOp::Write as i32, 0, request);

        let request = WriteRequest::read_from(self.memory(), PAYLOAD).unwrap();

        (request.ssize, request.count)
    }

    fn seek(&mut self, fd: i32, offset: i32, whence: i32) -> i32 {
        let request = SeekRequest { fd, offset, whence, foffset: UNTOUCHED };

        self.submit(FsOp::Seek as i32, 0, request);

        SeekRequest::read_from(self.memory(), PAYLOAD).unwrap().foffset
    }

    fn close(&mut self, fd: i32) -> i32 {
        self.submit(FsOp::Close as i32, fd, Envelope::default()).flag
    }

    fn is_open(&mut self, fd: i32) -> i32 {
        self.submit(FsOp::IsOpen as i32, fd, Envelope::default()).flag
    }

    fn open_count(&self) -> usize {
        self.dispatcher.files().table().open_count()
    }
}

fn irwxu() -> i32 {
    GuestMode::IRWXU.bits() as i32
}

fn create() -> GuestOpenFlags {
    GuestOpenFlags::WRONLY | GuestOpenFlags::CREAT | GuestOpenFlags::TRUNC
}

#[test]
fn hello_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.txt");
    let mut memory = GuestMemory::new(MEMORY_SIZE).unwrap();
    let mut guest = Guest::new(&mut memory);

    assert_eq!(guest.open(&path, create(), irwxu()), 0);
    assert_eq!(guest.write(0, b"Hello, world!\n", 14), (14, 14));
    assert_eq!(guest.close(0), 0);
    assert_eq!(guest.open_count(), 0);

    assert_eq!(std::fs::read(&path).unwrap(), b"Hello, world!\n");
    assert_eq!(std::fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o700);

    // The freed slot is handed out again.
    assert_eq!(guest.open(&path, GuestOpenFlags::RDONLY, MODE_UNSPECIFIED), 0);
    assert_eq!(guest.read(0, 5), (5, b"Hello".to_vec()));
    assert_eq!(guest.close(0), 0);
}

#[test]
fn create_without_mode_uses_the_default() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("default.txt");
    let mut memory = GuestMemory::new(MEMORY_SIZE).unwrap();
    let mut guest = Guest::new(&mut memory);

    assert_eq!(guest.open(&path, create(), MODE_UNSPECIFIED), 0);

    let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;

    assert_eq!(mode & !DEFAULT_CREATE_MODE, 0);
}

#[test]
fn invalid_flags_and_modes_fail() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("never.txt");
    let mut memory = GuestMemory::new(MEMORY_SIZE).unwrap();
    let mut guest = Guest::new(&mut memory);

    assert_eq!(guest.open(&path, GuestOpenFlags::CREAT, irwxu()), -1);
    assert_eq!(
        guest.open(&path, GuestOpenFlags::RDONLY | GuestOpenFlags::WRONLY | GuestOpenFlags::CREAT, irwxu()),
        -1
    );
    assert_eq!(guest.open(&path, create(), GuestMode::IRUSR.bits() as i32), -1);
    assert!(!path.exists());

    assert_eq!(guest.open(&dir.path().join("missing.txt"), GuestOpenFlags::RDONLY, irwxu()), -1);
    assert_eq!(guest.open_count(), 0);
}

#[test]
fn oversized_reads_fail_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.txt");
    let mut memory = GuestMemory::new(MEMORY_SIZE).unwrap();
    let mut guest = Guest::new(&mut memory);

    std::fs::write(&path, b"Hello, world!\n").unwrap();

    assert_eq!(guest.open(&path, GuestOpenFlags::RDONLY, MODE_UNSPECIFIED), 0);
    guest.memory().write(BUFFER, b"canary").unwrap();

    assert_eq!(guest.read(0, MAX_DATA as u32 + 1), (-1, vec![]));
    assert_eq!(guest.memory().read_vec(BUFFER, 6).unwrap(), b"canary");

    // The file offset did not move.
    assert_eq!(guest.read(0, 5), (5, b"Hello".to_vec()));

    // A buffer running past the end of guest memory.
    let request = ReadRequest { fd: 0, size: 0x20, buf: MEMORY_SIZE as u32 - 0x10, ssize: UNTOUCHED };

    guest.submit(FsOp::Read as i32, 0, request);
    assert_eq!(ReadRequest::read_from(guest.memory(), PAYLOAD).unwrap().ssize, -1);
}

#[test]
fn pathnames_must_be_terminated_inside_guest_memory() {
    let dir = tempfile::tempdir().unwrap();
    let mut memory = GuestMemory::new(MEMORY_SIZE).unwrap();
    let mut guest = Guest::new(&mut memory);

    guest.memory().write(MEMORY_SIZE as i64 - 1, b"a").unwrap();
    assert_eq!(guest.open_at(MEMORY_SIZE as u32 - 1, create(), irwxu()), -1);
    assert_eq!(guest.open_at(MEMORY_SIZE as u32 + 4, create(), irwxu()), -1);

    // 100 bytes without a terminator.
    let long = [b'a'; 100];

    guest.memory().write(PATHNAME, &long).unwrap();
    guest.memory().write(PATHNAME + 100, b"\0").unwrap();
    assert_eq!(guest.open_at(PATHNAME as u32, create(), irwxu()), -1);

    assert_eq!(guest.open_count(), 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn stale_descriptors_fail_and_leave_others_alone() {
    let dir = tempfile::tempdir().unwrap();
    let mut memory = GuestMemory::new(MEMORY_SIZE).unwrap();
    let mut guest = Guest::new(&mut memory);

    assert_eq!(guest.open(&dir.path().join("a"), create(), irwxu()), 0);
    assert_eq!(guest.open(&dir.path().join("b"), create(), irwxu()), 1);
    assert_eq!(guest.close(0), 0);

    assert_eq!(guest.is_open(0), 0);
    assert_eq!(guest.write(0, b"x", 1).0, -1);
    assert_eq!(guest.read(0, 1).0, -1);
    assert_eq!(guest.seek(0, 0, GuestWhence::SET.bits() as i32), -1);
    assert_eq!(guest.close(0), -1);

    for fd in [-1, 2, 1000] {
        assert_eq!(guest.is_open(fd), 0);
        assert_eq!(guest.close(fd), -1);
    }

    assert_eq!(guest.is_open(1), 1);
    assert_eq!(guest.write(1, b"still here", 10), (10, 10));
    assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), b"still here");

    // The lowest free slot is reused before the table grows.
    assert_eq!(guest.open(&dir.path().join("c"), create(), irwxu()), 0);
    assert_eq!(guest.open(&dir.path().join("d"), create(), irwxu()), 2);
    assert_eq!(guest.open_count(), 3);
}

#[test]
fn writes_stop_at_the_first_nul() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nul.txt");
    let mut memory = GuestMemory::new(MEMORY_SIZE).unwrap();
    let mut guest = Guest::new(&mut memory);

    assert_eq!(guest.open(&path, create(), irwxu()), 0);
    assert_eq!(guest.write(0, b"abc\0def", 7), (3, 3));
    assert_eq!(guest.write(0, b"ghij", 2), (2, 2));
    assert_eq!(std::fs::read(&path).unwrap(), b"abcgh");

    // A buffer running past the end of guest memory.
    let request = WriteRequest { fd: 0, buf: MEMORY_SIZE as u32 - 2, count: 4, ssize: UNTOUCHED };

    guest.submit(FsOp::Write as i32, 0, request);
    assert_eq!(WriteRequest::read_from(guest.memory(), PAYLOAD).unwrap().ssize, -1);
}

#[test]
fn seek_translates_whence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seek.txt");
    let mut memory = GuestMemory::new(MEMORY_SIZE).unwrap();
    let mut guest = Guest::new(&mut memory);

    std::fs::write(&path, b"Hello, world!\n").unwrap();

    let set = GuestWhence::SET.bits() as i32;
    let cur = GuestWhence::CUR.bits() as i32;
    let end = GuestWhence::END.bits() as i32;

    assert_eq!(guest.open(&path, GuestOpenFlags::RDONLY, MODE_UNSPECIFIED), 0);
    assert_eq!(guest.seek(0, 7, set), 7);
    assert_eq!(guest.read(0, 5), (5, b"world".to_vec()));
    assert_eq!(guest.seek(0, 0, cur), 12);
    assert_eq!(guest.seek(0, -6, end), 8);
    assert_eq!(guest.seek(0, 0, 0), -1);
    assert_eq!(guest.seek(0, 1 << 3, 1 << 3), -1);
    assert_eq!(guest.seek(0, -100, set), -1);
    assert_eq!(guest.seek(0, 0, cur), 8);
}

#[test]
fn seek_past_the_result_range_keeps_the_offset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sparse.txt");
    let mut memory = GuestMemory::new(MEMORY_SIZE).unwrap();
    let mut guest = Guest::new(&mut memory);

    let set = GuestWhence::SET.bits() as i32;
    let cur = GuestWhence::CUR.bits() as i32;

    assert_eq!(guest.open(&path, GuestOpenFlags::RDWR | GuestOpenFlags::CREAT, irwxu()), 0);
    assert_eq!(guest.seek(0, i32::MAX, set), i32::MAX);

    // The new offset would not fit the 32-bit result field.
    assert_eq!(guest.seek(0, 10, cur), -1);
    assert_eq!(guest.seek(0, 0, cur), i32::MAX);

    assert_eq!(guest.seek(0, 3, set), 3);
    assert_eq!(guest.seek(0, 0, cur), 3);
}

#[test]
fn unknown_operations_fail_in_the_envelope() {
    let mut memory = GuestMemory::new(MEMORY_SIZE).unwrap();
    let mut guest = Guest::new(&mut memory);

    assert_eq!(guest.submit(6, 0, Envelope::default()).flag, -1);
    assert_eq!(guest.submit(-3, 0, Envelope::default()).flag, -1);
}

#[test]
fn requests_outside_guest_memory_are_dropped() {
    let mut memory = GuestMemory::new(MEMORY_SIZE).unwrap();
    let mut guest = Guest::new(&mut memory);

    // An envelope straddling the end of guest memory.
    guest.notify(MEMORY_SIZE as u32 - 8);
    guest.notify(u32::MAX);

    // A payload straddling the end of guest memory.
    let envelope = Envelope {
        op: FsOp::Read as i32,
        fd: 0,
        flag: UNTOUCHED,
        payload: MEMORY_SIZE as u32 - 4,
    };

    guest.memory().write_obj(ENVELOPE, envelope).unwrap();
    guest.notify(ENVELOPE as u32);

    assert_eq!(Envelope::read_from(guest.memory(), ENVELOPE).unwrap(), envelope);
    assert_eq!(guest.open_count(), 0);
}

#[test]
fn short_file_reads_back_then_hits_end_of_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut memory = GuestMemory::new(MEMORY_SIZE).unwrap();
    let mut guest = Guest::new(&mut memory);

    let path = dir.path().join("t.txt");

    assert_eq!(guest.open(&path, create(), irwxu()), 0);
    assert_eq!(guest.write(0, b"hello", 5), (5, 5));
    assert_eq!(guest.close(0), 0);
    assert_eq!(std::fs::read(&path).unwrap(), b"hello");

    assert_eq!(guest.open(&path, GuestOpenFlags::RDONLY, MODE_UNSPECIFIED), 0);
    assert_eq!(guest.read(0, 5), (5, b"hello".to_vec()));
    assert_eq!(guest.read(0, 5), (0, vec![]));
    assert_eq!(guest.close(0), 0);
}
