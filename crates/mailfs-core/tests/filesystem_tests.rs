use std::path::PathBuf;
use std::sync::Arc;

use mailfs_core::mailbox::MailStore;
use mailfs_core::message::SIZE_HEADER;
use mailfs_core::*;
use tempfile::TempDir;

struct Mounted {
    staging: TempDir,
    store: Arc<InMemoryMailStore>,
    fs: MailFs,
}

fn mount() -> Mounted {
    let staging = TempDir::new().unwrap();
    let store = Arc::new(InMemoryMailStore::new());
    let config = FsConfig {
        staging_dir: staging.path().to_path_buf(),
        ..FsConfig::default()
    };
    let fs = MailFs::new(store.clone(), "INBOX", config).unwrap();
    Mounted {
        staging,
        store,
        fs,
    }
}

fn file_at(fs: &MailFs, path: &str) -> Arc<File> {
    fs.lookup(path).unwrap().unwrap().into_file().unwrap()
}

fn read_all(fs: &MailFs, path: &str) -> Vec<u8> {
    let size = fs.getattr(path).unwrap().size as usize;
    let fh = fs.open(path, 0).unwrap();
    let mut buf = vec![0u8; size + 16];
    let n = fs.read(path, fh, &mut buf, 0).unwrap();
    buf.truncate(n);
    buf
}

fn names(fs: &MailFs, path: &str) -> Vec<String> {
    fs.readdir(path).unwrap().into_iter().map(|e| e.name).collect()
}

fn staged_files(m: &Mounted) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut dirs = vec![m.staging.path().to_path_buf()];
    while let Some(dir) = dirs.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                dirs.push(path);
            } else {
                found.push(path);
            }
        }
    }
    found
}

#[test]
fn test_photos_scenario() {
    let m = mount();
    m.fs.mkdir("/photos", 0o755).unwrap();
    m.fs.create("/photos/x.bin", 0o644).unwrap();

    let fh = m.fs.open("/photos/x.bin", 0).unwrap();
    assert_eq!(m.fs.write("/photos/x.bin", fh, false, &[0xAA, 0xBB], 0).unwrap(), 2);
    m.fs.flush("/photos/x.bin", fh).unwrap();

    assert_eq!(m.fs.getattr("/photos/x.bin").unwrap().size, 2);
    assert_eq!(read_all(&m.fs, "/photos/x.bin"), vec![0xAA, 0xBB]);

    let uid = file_at(&m.fs, "/photos/x.bin").uid().unwrap();
    let stored = m.store.fetch_message("INBOX/photos", uid).unwrap();
    assert_eq!(stored.subject(), "x.bin");
    assert_eq!(stored.header(SIZE_HEADER), Some("2"));
    assert_eq!(stored.content(), &[0xAA, 0xBB]);
}

#[test]
fn test_resolve_after_create_reports_path() {
    let m = mount();
    m.fs.mkdir("/a", 0o755).unwrap();
    m.fs.mkdir("/a/b", 0o755).unwrap();
    m.fs.create("/a/b/c.txt", 0o644).unwrap();

    for path in ["/a", "/a/b", "/a/b/c.txt"] {
        let entry = m.fs.lookup(path).unwrap().unwrap();
        assert_eq!(entry.absolute_path().unwrap(), path);
    }
    assert_eq!(
        m.fs.lookup("/a/./b/../b/c.txt").unwrap().unwrap().name(),
        "c.txt"
    );
    assert!(m.fs.lookup("/a/missing").unwrap().is_none());
}

#[test]
fn test_intermediate_file_is_not_a_directory() {
    let m = mount();
    m.fs.create("/f", 0o644).unwrap();
    assert!(matches!(m.fs.lookup("/f/x"), Err(FsError::NotADirectory)));
    assert!(matches!(m.fs.readdir("/f"), Err(FsError::NotADirectory)));
}

#[test]
fn test_create_existing_fails() {
    let m = mount();
    m.fs.create("/f", 0o644).unwrap();
    assert!(matches!(m.fs.create("/f", 0o644), Err(FsError::AlreadyExists)));
    m.fs.mkdir("/d", 0o755).unwrap();
    assert!(matches!(m.fs.mkdir("/d", 0o755), Err(FsError::AlreadyExists)));
}

#[test]
fn test_round_trip_sets_size_header() {
    let m = mount();
    m.fs.create("/notes.txt", 0o644).unwrap();
    let fh = m.fs.open("/notes.txt", 0).unwrap();
    let body = b"dear diary, today I mounted my inbox";
    m.fs.write("/notes.txt", fh, false, body, 0).unwrap();
    m.fs.release("/notes.txt", fh, 0).unwrap();

    assert_eq!(read_all(&m.fs, "/notes.txt"), body.to_vec());

    let file = file_at(&m.fs, "/notes.txt");
    let stored = m.store.fetch_message("INBOX", file.uid().unwrap()).unwrap();
    assert_eq!(stored.declared_size(), Some(body.len() as u64));
    assert_eq!(
        stored.attachment().and_then(|a| a.content_type.as_deref()),
        Some("text/plain")
    );
}

#[test]
fn test_second_flush_is_a_no_op() {
    let m = mount();
    m.fs.create("/a.txt", 0o644).unwrap();
    let fh = m.fs.open("/a.txt", 0).unwrap();
    m.fs.write("/a.txt", fh, false, b"abc", 0).unwrap();

    let file = file_at(&m.fs, "/a.txt");
    assert_eq!(file.phase(), FilePhase::Staged);
    m.fs.flush("/a.txt", fh).unwrap();
    let uid = file.uid();
    assert_eq!(file.phase(), FilePhase::Clean);

    m.fs.flush("/a.txt", fh).unwrap();
    m.fs.fsync("/a.txt", fh, true).unwrap();
    assert_eq!(file.uid(), uid);
    assert_eq!(m.store.message_count("INBOX"), 1);
}

#[test]
fn test_reading_does_not_replace_message() {
    let m = mount();
    m.fs.create("/a.txt", 0o644).unwrap();
    let uid = file_at(&m.fs, "/a.txt").uid();
    let fh = m.fs.open("/a.txt", 0).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(m.fs.read("/a.txt", fh, &mut buf, 0).unwrap(), 0);
    m.fs.release("/a.txt", fh, 0).unwrap();
    assert_eq!(file_at(&m.fs, "/a.txt").uid(), uid);
}

#[test]
fn test_truncate_grow_pads_with_zeros() {
    let m = mount();
    m.fs.create("/t.bin", 0o644).unwrap();
    let fh = m.fs.open("/t.bin", 0).unwrap();
    m.fs.write("/t.bin", fh, false, b"abc", 0).unwrap();
    m.fs.flush("/t.bin", fh).unwrap();

    m.fs.truncate("/t.bin", 6).unwrap();
    assert_eq!(m.fs.getattr("/t.bin").unwrap().size, 6);

    let mut buf = [0xFFu8; 3];
    assert_eq!(m.fs.read("/t.bin", fh, &mut buf, 3).unwrap(), 3);
    assert_eq!(buf, [0, 0, 0]);
    assert_eq!(read_all(&m.fs, "/t.bin"), b"abc\0\0\0".to_vec());
}

#[test]
fn test_truncate_shrink_keeps_prefix() {
    let m = mount();
    m.fs.create("/t.bin", 0o644).unwrap();
    let fh = m.fs.open("/t.bin", 0).unwrap();
    m.fs.write("/t.bin", fh, false, b"abcdef", 0).unwrap();

    // Staged path: pending writes go out with the truncation
    m.fs.truncate("/t.bin", 4).unwrap();
    assert_eq!(read_all(&m.fs, "/t.bin"), b"abcd".to_vec());

    let file = file_at(&m.fs, "/t.bin");
    let stored = m.store.fetch_message("INBOX", file.uid().unwrap()).unwrap();
    assert_eq!(stored.declared_size(), Some(4));
}

#[test]
fn test_truncate_stored_file_without_local_copy() {
    let m = mount();
    let mut message = Message::new_file("log.txt", 0);
    message.set_content(b"abcdef".to_vec(), Some("text/plain"));
    m.store.append_message("INBOX", &message).unwrap();

    m.fs.truncate("/log.txt", 3).unwrap();
    assert_eq!(m.fs.getattr("/log.txt").unwrap().size, 3);
    assert!(staged_files(&m).is_empty());

    m.fs.truncate("/log.txt", 6).unwrap();
    assert!(staged_files(&m).is_empty());
    assert_eq!(read_all(&m.fs, "/log.txt"), b"abc\0\0\0".to_vec());

    let file = file_at(&m.fs, "/log.txt");
    let stored = m.store.fetch_message("INBOX", file.uid().unwrap()).unwrap();
    assert_eq!(stored.declared_size(), Some(6));
    assert_eq!(stored.content(), b"abc\0\0\0");
}

#[test]
fn test_write_gap_reads_as_zeros() {
    let m = mount();
    m.fs.create("/gap", 0o644).unwrap();
    let fh = m.fs.open("/gap", 0).unwrap();
    m.fs.write("/gap", fh, false, &[7], 5).unwrap();
    assert_eq!(read_all(&m.fs, "/gap"), vec![0, 0, 0, 0, 0, 7]);

    m.fs.flush("/gap", fh).unwrap();
    assert_eq!(read_all(&m.fs, "/gap"), vec![0, 0, 0, 0, 0, 7]);
}

#[test]
fn test_listing_after_create_and_delete() {
    let m = mount();
    m.fs.create("/a.txt", 0o644).unwrap();
    m.fs.create("/b.txt", 0o644).unwrap();
    assert_eq!(names(&m.fs, "/"), vec!["a.txt", "b.txt"]);

    let held = file_at(&m.fs, "/a.txt");
    m.fs.unlink("/a.txt").unwrap();
    assert_eq!(names(&m.fs, "/"), vec!["b.txt"]);
    assert!(matches!(m.fs.getattr("/a.txt"), Err(FsError::NotFound)));
    assert!(held.is_detached());
    assert_eq!(m.store.message_count("INBOX"), 1);
}

#[test]
fn test_rmdir_removes_folder() {
    let m = mount();
    m.fs.mkdir("/d", 0o755).unwrap();
    let dir = m.fs.lookup("/d").unwrap().unwrap().into_directory().unwrap();
    m.fs.rmdir("/d").unwrap();

    assert!(dir.is_defunct());
    assert!(names(&m.fs, "/").is_empty());
    assert!(!m.store.folder_exists("INBOX/d").unwrap());
    assert!(matches!(m.fs.rmdir("/"), Err(FsError::InvalidPath(_))));
}

#[test]
fn test_directory_rename_moves_descendants() {
    let m = mount();
    m.fs.mkdir("/a", 0o755).unwrap();
    m.fs.mkdir("/a/b", 0o755).unwrap();
    m.fs.create("/a/b/f.txt", 0o644).unwrap();
    let fh = m.fs.open("/a/b/f.txt", 0).unwrap();
    m.fs.write("/a/b/f.txt", fh, false, b"kept", 0).unwrap();

    let dir = m.fs.lookup("/a").unwrap().unwrap().into_directory().unwrap();
    let file = file_at(&m.fs, "/a/b/f.txt");

    m.fs.rename("/a", "/z").unwrap();

    assert_eq!(dir.absolute_path().unwrap(), "/z");
    assert_eq!(dir.folder().unwrap(), "INBOX/z");
    assert_eq!(file.absolute_path().unwrap(), "/z/b/f.txt");
    assert_eq!(names(&m.fs, "/"), vec!["z"]);
    assert!(m.store.folder_exists("INBOX/z/b").unwrap());

    // Unflushed writes survive the rename and land in the renamed folder
    assert_eq!(file.phase(), FilePhase::Staged);
    m.fs.flush("/z/b/f.txt", fh).unwrap();
    assert_eq!(read_all(&m.fs, "/z/b/f.txt"), b"kept".to_vec());
    let uid = file.uid().unwrap();
    assert_eq!(
        m.store.fetch_message("INBOX/z/b", uid).unwrap().content(),
        b"kept"
    );
}

#[test]
fn test_directory_move_into_other_directory() {
    let m = mount();
    m.fs.mkdir("/src", 0o755).unwrap();
    m.fs.mkdir("/dst", 0o755).unwrap();
    m.fs.mkdir("/src/inner", 0o755).unwrap();

    m.fs.rename("/src/inner", "/dst/moved").unwrap();
    assert_eq!(names(&m.fs, "/src"), Vec::<String>::new());
    assert_eq!(names(&m.fs, "/dst"), vec!["moved"]);
    assert!(m.store.folder_exists("INBOX/dst/moved").unwrap());
}

#[test]
fn test_rejected_directory_rename() {
    let m = mount();
    m.fs.mkdir("/a", 0o755).unwrap();
    m.store.reject_renames(true);

    assert!(matches!(m.fs.rename("/a", "/b"), Err(FsError::RenameFailed(_))));
    m.store.reject_renames(false);

    // Still usable under its old name
    m.fs.create("/a/f", 0o644).unwrap();
    assert_eq!(names(&m.fs, "/a"), vec!["f"]);
}

#[test]
fn test_file_rename_and_move() {
    let m = mount();
    m.fs.mkdir("/docs", 0o755).unwrap();
    m.fs.create("/draft.txt", 0o644).unwrap();
    let fh = m.fs.open("/draft.txt", 0).unwrap();
    m.fs.write("/draft.txt", fh, false, b"v1", 0).unwrap();

    m.fs.rename("/draft.txt", "/final.txt").unwrap();
    assert_eq!(names(&m.fs, "/"), vec!["docs", "final.txt"]);
    assert_eq!(read_all(&m.fs, "/final.txt"), b"v1".to_vec());

    m.fs.rename("/final.txt", "/docs/report.txt").unwrap();
    assert_eq!(names(&m.fs, "/"), vec!["docs"]);
    assert_eq!(names(&m.fs, "/docs"), vec!["report.txt"]);
    assert_eq!(read_all(&m.fs, "/docs/report.txt"), b"v1".to_vec());
    assert_eq!(m.store.message_count("INBOX"), 0);
    assert_eq!(m.store.message_count("INBOX/docs"), 1);
}

#[test]
fn test_rename_over_existing_file_replaces_it() {
    let m = mount();
    for (path, body) in [("/old", b"old".as_slice()), ("/new", b"new".as_slice())] {
        m.fs.create(path, 0o644).unwrap();
        let fh = m.fs.open(path, 0).unwrap();
        m.fs.write(path, fh, false, body, 0).unwrap();
        m.fs.release(path, fh, 0).unwrap();
    }

    m.fs.rename("/new", "/old").unwrap();
    assert_eq!(names(&m.fs, "/"), vec!["old"]);
    assert_eq!(read_all(&m.fs, "/old"), b"new".to_vec());
    assert_eq!(m.store.message_count("INBOX"), 1);
}

#[test]
fn test_utimens_sets_sent_date() {
    let m = mount();
    m.fs.create("/f", 0o644).unwrap();
    m.fs.utimens("/f", None, Some(1_234_567_890)).unwrap();
    assert_eq!(m.fs.getattr("/f").unwrap().mtime, 1_234_567_890);

    // Directories carry no times
    m.fs.mkdir("/d", 0o755).unwrap();
    m.fs.utimens("/d", Some(1), Some(2)).unwrap();
    assert_eq!(m.fs.getattr("/d").unwrap().mtime, 0);
}

#[test]
fn test_failed_flush_keeps_local_copy_for_retry() {
    let m = mount();
    m.fs.create("/precious", 0o644).unwrap();
    let fh = m.fs.open("/precious", 0).unwrap();
    m.fs.write("/precious", fh, false, b"do not lose me", 0).unwrap();

    m.store.fail_next_append();
    assert!(matches!(
        m.fs.flush("/precious", fh),
        Err(FsError::Transport(_))
    ));

    let file = file_at(&m.fs, "/precious");
    assert_eq!(file.phase(), FilePhase::FlushPending);
    assert_eq!(file.uid(), None);
    assert_eq!(names(&m.fs, "/"), vec!["precious"]);
    assert_eq!(read_all(&m.fs, "/precious"), b"do not lose me".to_vec());

    m.fs.flush("/precious", fh).unwrap();
    assert_eq!(file.phase(), FilePhase::Clean);
    assert_eq!(m.store.message_count("INBOX"), 1);
    let stored = m.store.fetch_message("INBOX", file.uid().unwrap()).unwrap();
    assert_eq!(stored.content(), b"do not lose me");
}

#[test]
fn test_subjects_with_slashes_use_last_segment() {
    let m = mount();
    let mut message = Message::new_file("mail/attachments/report.pdf", 0);
    message.set_content(b"%PDF".to_vec(), Some("application/pdf"));
    m.store.append_message("INBOX", &message).unwrap();

    assert_eq!(names(&m.fs, "/"), vec!["report.pdf"]);
    assert_eq!(read_all(&m.fs, "/report.pdf"), b"%PDF".to_vec());
}

#[test]
fn test_external_changes_show_after_refresh() {
    let m = mount();
    assert!(names(&m.fs, "/").is_empty());
    m.store.create_folder("INBOX/external").unwrap();

    // The cache is still valid until forced
    assert!(names(&m.fs, "/").is_empty());
    let listed = m.fs.root().list_children(true).unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].is_dir());
}

#[test]
fn test_tree_lines() {
    let m = mount();
    m.fs.mkdir("/photos", 0o755).unwrap();
    m.fs.create("/photos/x.bin", 0o644).unwrap();
    m.fs.create("/readme", 0o644).unwrap();

    assert_eq!(
        m.fs.root().tree_lines().unwrap(),
        vec![
            "/".to_string(),
            "  photos/".to_string(),
            "    x.bin (0 bytes)".to_string(),
            "  readme (0 bytes)".to_string(),
        ]
    );
}

#[test]
fn test_size_falls_back_to_attachment_length() {
    let m = mount();
    let mut message = Message::new_file("ext.bin", 1);
    message.set_content(b"hello".to_vec(), None);
    message.remove_header(SIZE_HEADER);
    m.store.append_message("INBOX", &message).unwrap();

    assert_eq!(m.fs.getattr("/ext.bin").unwrap().size, 5);
    assert_eq!(read_all(&m.fs, "/ext.bin"), b"hello".to_vec());
}

#[test]
fn test_unflushed_file_survives_directory_rename() {
    let m = mount();
    m.fs.mkdir("/a", 0o755).unwrap();
    m.fs.create("/a/f.txt", 0o644).unwrap();
    let kept_fh = m.fs.open("/a/f.txt", 0).unwrap();
    m.fs.write("/a/f.txt", kept_fh, false, b"kept", 0).unwrap();

    m.fs.rename("/a", "/z").unwrap();
    m.fs.mkdir("/a", 0o755).unwrap();
    m.fs.create("/a/f.txt", 0o644).unwrap();
    let fh = m.fs.open("/a/f.txt", 0).unwrap();
    m.fs.write("/a/f.txt", fh, false, b"X", 0).unwrap();

    m.fs.flush("/z/f.txt", kept_fh).unwrap();
    assert_eq!(read_all(&m.fs, "/z/f.txt"), b"kept".to_vec());
    let moved = file_at(&m.fs, "/z/f.txt");
    let stored = m.store.fetch_message("INBOX/z", moved.uid().unwrap()).unwrap();
    assert_eq!(stored.content(), b"kept");

    m.fs.flush("/a/f.txt", fh).unwrap();
    assert_eq!(read_all(&m.fs, "/a/f.txt"), b"X".to_vec());
}

#[test]
fn test_directory_replaces_deleted_file_of_same_name() {
    let m = mount();
    m.fs.create("/x", 0o644).unwrap();
    let fh = m.fs.open("/x", 0).unwrap();
    m.fs.write("/x", fh, false, b"old", 0).unwrap();
    m.fs.release("/x", fh, 0).unwrap();
    m.fs.unlink("/x").unwrap();
    assert!(staged_files(&m).is_empty());

    m.fs.mkdir("/x", 0o755).unwrap();
    m.fs.create("/x/y", 0o644).unwrap();
    let fh = m.fs.open("/x/y", 0).unwrap();
    assert_eq!(m.fs.write("/x/y", fh, false, b"new", 0).unwrap(), 3);
    m.fs.flush("/x/y", fh).unwrap();
    assert_eq!(read_all(&m.fs, "/x/y"), b"new".to_vec());
}
