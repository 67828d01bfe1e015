//! End-to-end save scenarios over real repositories on disk.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use packstash::config::Config;
use packstash::repo::{PlainRepo, Repository};
use packstash::save::{save_stream, SaveOptions, WalkEntry};
use packstash::tree::{decode_tree, mode_is_dir, parse_commit_refs};
use packstash::{Kind, ObjectId};

fn file_entry(path: &str, data: Vec<u8>) -> packstash::Result<WalkEntry> {
    Ok(WalkEntry::File {
        path:    PathBuf::from(path),
        mode:    0o100644,
        stat:    format!("stat:{path}").into_bytes(),
        content: Box::new(Cursor::new(data)),
    })
}

fn dir_entry(path: &str) -> packstash::Result<WalkEntry> {
    Ok(WalkEntry::Dir {
        path: PathBuf::from(path),
        mode: 0o040755,
        stat: format!("stat:{path}").into_bytes(),
    })
}

/// Deterministic pseudo-random bytes (xorshift) so blobs actually split.
fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

/// Total bytes of finalized pack files in a plain repository.
fn pack_bytes(root: &Path) -> u64 {
    fs::read_dir(root.join("objects/pack"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".pack"))
        .map(|e| e.metadata().unwrap().len())
        .sum()
}

/// Recursively enumerate `(path, mode, id)` leaves of a stored tree,
/// flattening tree-split indirection (guided by the `<depth>.bupd`
/// marker) and skipping companion files.
fn logical_entries(
    repo: &mut PlainRepo,
    tree: &ObjectId,
    prefix: &str,
    out: &mut HashMap<String, (u32, ObjectId)>,
) {
    let (_, payload) = repo.read_object(tree).unwrap();
    let entries = decode_tree(&payload).unwrap();

    let depth = entries.iter().find_map(|e| {
        String::from_utf8_lossy(&e.name)
            .strip_suffix(".bupd")
            .and_then(|d| d.parse::<usize>().ok())
    });
    if let Some(depth) = depth {
        collect_split(repo, tree, depth, prefix, out);
        return;
    }

    for e in entries {
        let name = String::from_utf8(e.name.clone()).unwrap();
        if name == ".bupm" {
            continue;
        }
        let path = if prefix.is_empty() { name } else { format!("{prefix}/{name}") };
        if mode_is_dir(e.mode) {
            logical_entries(repo, &e.id, &path, out);
        } else {
            out.insert(path, (e.mode, e.id));
        }
    }
}

/// Descend `layers` levels of prefix indirection without extending the
/// logical path, then treat entries as real directory content.
fn collect_split(
    repo: &mut PlainRepo,
    tree: &ObjectId,
    layers: usize,
    prefix: &str,
    out: &mut HashMap<String, (u32, ObjectId)>,
) {
    let (_, payload) = repo.read_object(tree).unwrap();
    for e in decode_tree(&payload).unwrap() {
        let name = String::from_utf8(e.name.clone()).unwrap();
        if name == ".bupm" || name.ends_with(".bupd") {
            continue;
        }
        if layers > 0 {
            collect_split(repo, &e.id, layers - 1, prefix, out);
        } else {
            let path = if prefix.is_empty() { name } else { format!("{prefix}/{name}") };
            if mode_is_dir(e.mode) {
                logical_entries(repo, &e.id, &path, out);
            } else {
                out.insert(path, (e.mode, e.id));
            }
        }
    }
}

#[test]
fn shared_prefix_deduplicates_across_files() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("repo");
    let mut repo = PlainRepo::init(&root, Config::default()).unwrap();

    // B = A || X with X small; the shared prefix must dedup.
    let a = noise(600_000, 7);
    let mut b = a.clone();
    b.extend_from_slice(b"trailing divergence");

    save_stream(&mut repo, vec![file_entry("a.bin", a)], &SaveOptions::new("main")).unwrap();
    let after_a = pack_bytes(&root);

    save_stream(
        &mut repo,
        vec![file_entry("b.bin", b.clone())],
        &SaveOptions::new("main"),
    )
    .unwrap();
    let after_b = pack_bytes(&root);

    assert!(
        after_b - after_a < b.len() as u64 / 4,
        "saving B should reuse A's blobs: grew {} for a {}-byte file",
        after_b - after_a,
        b.len()
    );
}

#[test]
fn every_referenced_id_exists_after_commit() {
    let tmp = tempfile::tempdir().unwrap();
    let mut repo = PlainRepo::init(&tmp.path().join("repo"), Config::default()).unwrap();

    let entries = vec![
        file_entry("dir/big.bin", noise(400_000, 3)),
        file_entry("dir/small.txt", b"tiny".to_vec()),
        dir_entry("dir"),
        file_entry("top.txt", b"top level".to_vec()),
    ];
    let commit_id = save_stream(&mut repo, entries, &SaveOptions::new("main")).unwrap();

    // Breadth-first closure over the stored graph.
    let (_, commit) = repo.read_object(&commit_id).unwrap();
    let (root_tree, _) = parse_commit_refs(&commit).unwrap();
    let mut queue = vec![root_tree];
    let mut seen = HashSet::new();
    while let Some(id) = queue.pop() {
        if !seen.insert(id) {
            continue;
        }
        assert!(repo.exists(&id).unwrap(), "referenced id {id} missing");
        let (kind, payload) = repo.read_object(&id).unwrap();
        if kind == Kind::Tree {
            for entry in decode_tree(&payload).unwrap() {
                queue.push(entry.id);
            }
        }
    }
    assert!(seen.len() > 4, "expected a real object graph, got {}", seen.len());
}

#[test]
fn treesplit_and_plain_enumerate_identical_entries() {
    let tmp = tempfile::tempdir().unwrap();

    let entries_for = || -> Vec<packstash::Result<WalkEntry>> {
        let mut v: Vec<packstash::Result<WalkEntry>> = (0..1200)
            .map(|i| file_entry(&format!("big/{i:05}{i:05}"), noise(32, i as u32 + 1)))
            .collect();
        v.push(dir_entry("big"));
        v
    };

    let mut split_cfg = Config::default();
    split_cfg.treesplit = true;
    let split_root = tmp.path().join("split");
    let mut split_repo = PlainRepo::init(&split_root, split_cfg).unwrap();
    let split_commit =
        save_stream(&mut split_repo, entries_for(), &SaveOptions::new("main")).unwrap();

    let plain_root = tmp.path().join("plain");
    let mut plain_repo = PlainRepo::init(&plain_root, Config::default()).unwrap();
    let plain_commit =
        save_stream(&mut plain_repo, entries_for(), &SaveOptions::new("main")).unwrap();

    let (_, c1) = split_repo.read_object(&split_commit).unwrap();
    let (t1, _) = parse_commit_refs(&c1).unwrap();
    let (_, c2) = plain_repo.read_object(&plain_commit).unwrap();
    let (t2, _) = parse_commit_refs(&c2).unwrap();

    // Different structure, same logical content.
    assert_ne!(t1, t2);
    let mut split_set = HashMap::new();
    logical_entries(&mut split_repo, &t1, "", &mut split_set);
    let mut plain_set = HashMap::new();
    logical_entries(&mut plain_repo, &t2, "", &mut plain_set);
    assert_eq!(split_set.len(), 1200);
    assert_eq!(split_set, plain_set);
}

#[test]
fn racing_writers_both_land_on_the_branch() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("repo");
    PlainRepo::init(&root, Config::default()).unwrap();

    let mk_entries = |tag: u32| vec![file_entry(&format!("file-{tag}.bin"), noise(100_000, tag))];

    let handles: Vec<_> = (1..=2u32)
        .map(|tag| {
            let root = root.clone();
            std::thread::spawn(move || {
                let mut repo = PlainRepo::open(&root).unwrap();
                save_stream(&mut repo, mk_entries(tag), &SaveOptions::new("main")).unwrap()
            })
        })
        .collect();
    let commits: Vec<ObjectId> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Both sessions succeeded; the loser rebased, so the final tip's
    // parent chain contains both commits.
    let mut repo = PlainRepo::open(&root).unwrap();
    let mut chain = HashSet::new();
    let mut cursor = repo.read_ref("main").unwrap();
    while let Some(id) = cursor {
        chain.insert(id);
        let (_, payload) = repo.read_object(&id).unwrap();
        let (_, parents) = parse_commit_refs(&payload).unwrap();
        cursor = parents.first().copied();
    }
    for commit in &commits {
        assert!(chain.contains(commit), "commit {commit} fell off the branch");
    }
}

#[test]
fn save_twice_only_rewrites_the_commit() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("repo");
    let data = noise(300_000, 11);

    let mut repo = PlainRepo::init(&root, Config::default()).unwrap();
    save_stream(
        &mut repo,
        vec![file_entry("same.bin", data.clone())],
        &SaveOptions::new("main"),
    )
    .unwrap();
    drop(repo);
    let first = pack_bytes(&root);

    let mut repo = PlainRepo::open(&root).unwrap();
    save_stream(
        &mut repo,
        vec![file_entry("same.bin", data)],
        &SaveOptions::new("main"),
    )
    .unwrap();
    let summary = repo.summary();
    drop(repo);

    assert_eq!(summary.objects_written, 1, "only the re-parented commit is new");
    assert!(pack_bytes(&root) - first < 1024);
}

mod encrypted {
    use super::*;
    use packstash::repo::EncryptedRepo;

    fn stored_pack_lens(repo_root: &Path) -> Vec<u64> {
        let mut lens: Vec<u64> = fs::read_dir(repo_root.join("store/objects/pack"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".pack"))
            .map(|e| e.metadata().unwrap().len())
            .collect();
        lens.sort_unstable();
        lens
    }

    #[test]
    fn same_plaintext_same_ciphertext_length_under_different_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let entries =
            || vec![file_entry("payload.bin", vec![0x5Au8; 150_000])];

        let mut lens = Vec::new();
        for (i, passphrase) in ["first secret", "second secret"].iter().enumerate() {
            let root = tmp.path().join(format!("repo{i}"));
            let mut repo = EncryptedRepo::init(&root, passphrase, Config::default()).unwrap();
            let mut opts = SaveOptions::new("main");
            opts.when = Some(chrono::TimeZone::timestamp_opt(&chrono::Utc, 1_700_000_000, 0).unwrap());
            save_stream(&mut repo, entries(), &opts).unwrap();
            lens.push(stored_pack_lens(&root));
        }

        // Distinct key material, identical plaintext sizes: the stored
        // ciphertext lengths must match block-for-block.
        assert!(!lens[0].is_empty());
        assert_eq!(lens[0], lens[1]);
    }

    #[test]
    fn encrypted_save_round_trips_through_the_ref() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("repo");
        let mut repo = EncryptedRepo::init(&root, "pw", Config::default()).unwrap();
        let commit = save_stream(
            &mut repo,
            vec![file_entry("f.txt", b"encrypted contents".to_vec())],
            &SaveOptions::new("main"),
        )
        .unwrap();
        drop(repo);

        let mut repo = EncryptedRepo::open(&root, "pw").unwrap();
        assert_eq!(repo.read_ref("main").unwrap(), Some(commit));
        assert!(repo.exists(&commit).unwrap());
    }
}
