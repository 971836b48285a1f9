//! Property-based tests comparing file operations against an in-memory model.

use proptest::prelude::*;
use uring_file::{ConfigBuilder, DriverKind, EventLoop, File, OpenOptions, OwnedBuffer};

#[derive(Debug, Clone)]
enum Action {
    Write { offset: u64, data: Vec<u8> },
    WriteVectored { offset: u64, parts: Vec<Vec<u8>> },
    Read { offset: u64, len: usize },
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0u64..512, prop::collection::vec(any::<u8>(), 1..64))
            .prop_map(|(offset, data)| Action::Write { offset, data }),
        (
            0u64..512,
            prop::collection::vec(prop::collection::vec(any::<u8>(), 1..32), 1..4)
        )
            .prop_map(|(offset, parts)| Action::WriteVectored { offset, parts }),
        (0u64..640, 1usize..96).prop_map(|(offset, len)| Action::Read { offset, len }),
    ]
}

fn write_model(model: &mut Vec<u8>, offset: u64, data: &[u8]) {
    let start = offset as usize;
    if model.len() < start + data.len() {
        model.resize(start + data.len(), 0);
    }
    model[start..start + data.len()].copy_from_slice(data);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn file_matches_model(actions in prop::collection::vec(action(), 1..24)) {
        let config = ConfigBuilder::new()
            .driver(DriverKind::Blocking)
            .registry_capacity(4)
            .build()
            .unwrap();
        let event_loop = EventLoop::spawn(config).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        let file = File::open(&event_loop.handle(), dir.path().join("model.bin"), &options)
            .join()
            .unwrap();

        let mut model = Vec::new();
        for action in &actions {
            match action {
                Action::Write { offset, data } => {
                    let buffer = OwnedBuffer::from_slice(data);
                    let n = file.write(&buffer, *offset, false).join().unwrap();
                    prop_assert_eq!(n as usize, data.len());
                    prop_assert_eq!(buffer.readable_bytes(), 0);
                    write_model(&mut model, *offset, data);
                }
                Action::WriteVectored { offset, parts } => {
                    let buffers: Vec<_> = parts.iter().map(|p| OwnedBuffer::from_slice(p)).collect();
                    let joined: Vec<u8> = parts.concat();
                    let n = file.write_vectored(&buffers, *offset).join().unwrap();
                    prop_assert_eq!(n as usize, joined.len());
                    write_model(&mut model, *offset, &joined);
                }
                Action::Read { offset, len } => {
                    let buffer = OwnedBuffer::new(*len);
                    let n = file.read(&buffer, *offset).join().unwrap() as usize;
                    let start = (*offset as usize).min(model.len());
                    let end = (start + len).min(model.len());
                    prop_assert_eq!(n, end - start);
                    prop_assert_eq!(buffer.readable().unwrap(), model[start..end].to_vec());
                }
            }
            prop_assert_eq!(file.in_flight().join().unwrap(), 0);
        }

        file.close().join().unwrap();
        prop_assert_eq!(std::fs::read(dir.path().join("model.bin")).unwrap(), model);
    }
}
