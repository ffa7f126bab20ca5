use assert_matches::assert_matches;
use layer_dedup::filter::dedup_archive;
use layer_dedup::{DedupError, DedupOptions};
use rstest::rstest;
use tar::{Builder, EntryType, Header};

/// An entry of a rewritten archive as a tar reader sees it.
#[derive(Debug, PartialEq, Eq)]
struct ReadEntry {
    path: String,
    entry_type: EntryType,
    link_name: Option<String>,
    size: u64,
    data: Vec<u8>,
}

fn append_file(builder: &mut Builder<Vec<u8>>, path: &str, data: &[u8]) {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_uid(1000);
    header.set_gid(1000);
    header.set_mtime(1_700_000_000);
    header.set_cksum();
    builder.append_data(&mut header, path, data).unwrap();
}

fn append_symlink(builder: &mut Builder<Vec<u8>>, path: &str, target: &str) {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Symlink);
    header.set_size(0);
    header.set_mode(0o777);
    header.set_cksum();
    builder.append_link(&mut header, path, target).unwrap();
}

fn append_pax(builder: &mut Builder<Vec<u8>>, records: &[(&str, &str)]) {
    let mut data = Vec::new();
    for (key, value) in records {
        // "<len> <key>=<value>\n" where the length counts itself
        let payload = key.len() + value.len() + 3;
        let mut len = payload;
        while payload + len.to_string().len() != len {
            len = payload + len.to_string().len();
        }
        data.extend_from_slice(format!("{len} {key}={value}\n").as_bytes());
    }
    let mut header = Header::new_ustar();
    header.set_path("PaxHeaders.0/entry").unwrap();
    header.set_entry_type(EntryType::XHeader);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, data.as_slice()).unwrap();
}

fn read_entries(archive: &[u8]) -> Vec<ReadEntry> {
    let mut archive = tar::Archive::new(archive);
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let mut data = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut data).unwrap();
            ReadEntry {
                path: String::from_utf8(entry.path_bytes().into_owned()).unwrap(),
                entry_type: entry.header().entry_type(),
                link_name: entry
                    .link_name_bytes()
                    .map(|name| String::from_utf8(name.into_owned()).unwrap()),
                size: entry.header().size().unwrap(),
                data,
            }
        })
        .collect()
}

fn dedup(input: &[u8], options: &DedupOptions) -> (Vec<u8>, layer_dedup::DedupStats) {
    let mut out = Vec::new();
    let stats = dedup_archive(input, &mut out, options).unwrap();
    (out, stats)
}

/// The number of bytes a regular file occupies in an archive, header included.
fn file_blocks(len: usize) -> usize {
    512 + len.div_ceil(512) * 512
}

#[test]
fn test_duplicate_becomes_link() {
    let x = vec![b'x'; 2000];
    let y: Vec<u8> = (0..15000u32).map(|i| (i % 251) as u8).collect();

    let mut builder = Builder::new(Vec::new());
    append_file(&mut builder, "a", &x);
    append_file(&mut builder, "b", &y);
    append_file(&mut builder, "c", &y);
    let input = builder.into_inner().unwrap();

    let (out, stats) = dedup(&input, &DedupOptions::default().with_threshold(10_000));
    assert_eq!(stats.entries, 3);
    assert_eq!(stats.candidates, 2);
    assert_eq!(stats.links, 1);
    assert_eq!(stats.unique_contents, 1);
    assert_eq!(stats.bytes_saved, 15_000);

    // a and b are copied as they were
    let unchanged = file_blocks(x.len()) + file_blocks(y.len());
    assert_eq!(out[..unchanged], input[..unchanged]);

    let entries = read_entries(&out);
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].data, x);
    assert_eq!(entries[1].data, y);
    assert_eq!(
        entries[2],
        ReadEntry {
            path: String::from("c"),
            entry_type: EntryType::Link,
            link_name: Some(String::from("b")),
            size: 0,
            data: Vec::new(),
        }
    );

    // header block of the link, then the end-of-archive marker
    assert_eq!(out.len(), unchanged + 512 + 1024);
}

#[test]
fn test_link_keeps_metadata() {
    let content = vec![9u8; 12_000];
    let mut builder = Builder::new(Vec::new());
    append_file(&mut builder, "first", &content);
    append_file(&mut builder, "second", &content);
    let input = builder.into_inner().unwrap();

    let (out, _) = dedup(&input, &DedupOptions::default());
    let mut archive = tar::Archive::new(out.as_slice());
    let entry = archive.entries().unwrap().nth(1).unwrap().unwrap();
    let header = entry.header();
    assert_eq!(header.entry_type(), EntryType::Link);
    assert_eq!(header.mode().unwrap(), 0o644);
    assert_eq!(header.uid().unwrap(), 1000);
    assert_eq!(header.gid().unwrap(), 1000);
    assert_eq!(header.mtime().unwrap(), 1_700_000_000);
}

#[test]
fn test_no_duplicates_is_byte_identical() {
    let mut builder = Builder::new(Vec::new());
    append_symlink(&mut builder, "usr/bin/python", "python3.12");
    append_file(&mut builder, "usr/bin/python3.12", &[1u8; 20_000]);
    append_file(&mut builder, "etc/hostname", b"layer\n");
    let input = builder.into_inner().unwrap();

    let (out, stats) = dedup(&input, &DedupOptions::default().with_threshold(10_000));
    assert_eq!(out, input);
    assert_eq!(stats.entries, 3);
    assert_eq!(stats.candidates, 1);
    assert_eq!(stats.links, 0);
    assert_eq!(stats.unique_contents, 1);
    assert_eq!(stats.bytes_saved, 0);
}

#[test]
fn test_small_duplicates_pass_through() {
    let mut builder = Builder::new(Vec::new());
    append_file(&mut builder, "one", b"same content");
    append_file(&mut builder, "two", b"same content");
    let input = builder.into_inner().unwrap();

    let (out, stats) = dedup(&input, &DedupOptions::default());
    assert_eq!(out, input);
    assert_eq!(stats.candidates, 0);
}

#[test]
fn test_empty_files_are_never_linked() {
    let mut builder = Builder::new(Vec::new());
    append_file(&mut builder, "empty-1", b"");
    append_file(&mut builder, "empty-2", b"");
    let input = builder.into_inner().unwrap();

    let (out, stats) = dedup(&input, &DedupOptions::default().with_threshold(0));
    assert_eq!(out, input);
    assert_eq!(stats.candidates, 0);
    assert_eq!(stats.links, 0);
}

#[rstest]
#[case(10_000, false)]
#[case(10_001, true)]
fn test_threshold_boundary(#[case] size: usize, #[case] linked: bool) {
    let content = vec![0xA5u8; size];
    let mut builder = Builder::new(Vec::new());
    append_file(&mut builder, "a", &content);
    append_file(&mut builder, "b", &content);
    let input = builder.into_inner().unwrap();

    let (out, stats) = dedup(&input, &DedupOptions::default().with_threshold(10_000));
    assert_eq!(stats.links, u64::from(linked));
    let entries = read_entries(&out);
    assert_eq!(entries[1].entry_type == EntryType::Link, linked);
}

#[test]
fn test_links_never_target_links() {
    let content = vec![7u8; 16_384];
    let mut builder = Builder::new(Vec::new());
    append_file(&mut builder, "a", &content);
    append_file(&mut builder, "b", &content);
    append_file(&mut builder, "c", &content);
    let input = builder.into_inner().unwrap();

    let (out, stats) = dedup(&input, &DedupOptions::default());
    assert_eq!(stats.links, 2);
    assert_eq!(stats.bytes_saved, 2 * 16_384);

    let entries = read_entries(&out);
    assert_eq!(entries[0].entry_type, EntryType::Regular);
    for entry in &entries[1..] {
        assert_eq!(entry.entry_type, EntryType::Link);
        assert_eq!(entry.link_name.as_deref(), Some("a"));
    }
}

#[test]
fn test_existing_hard_links_are_not_indexed() {
    let content = vec![4u8; 11_000];
    let mut builder = Builder::new(Vec::new());
    append_file(&mut builder, "data/original", &content);

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Link);
    header.set_size(0);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_link(&mut header, "data/existing-link", "data/original")
        .unwrap();

    append_file(&mut builder, "data/copy", &content);
    let input = builder.into_inner().unwrap();

    let (out, stats) = dedup(&input, &DedupOptions::default());
    assert_eq!(stats.entries, 3);
    assert_eq!(stats.candidates, 2);
    assert_eq!(stats.links, 1);

    let entries = read_entries(&out);
    assert_eq!(entries[1].link_name.as_deref(), Some("data/original"));
    assert_eq!(entries[2].link_name.as_deref(), Some("data/original"));
}

#[test]
fn test_repeated_runs_are_identical() {
    let mut builder = Builder::new(Vec::new());
    for i in 0..8 {
        let content = vec![(i % 3) as u8; 10_500];
        append_file(&mut builder, &format!("dir/file-{i}"), &content);
    }
    let input = builder.into_inner().unwrap();

    let (first, first_stats) = dedup(&input, &DedupOptions::default());
    let (second, second_stats) = dedup(&input, &DedupOptions::default());
    assert_eq!(first, second);
    assert_eq!(first_stats, second_stats);
    assert_eq!(first_stats.unique_contents, 3);
    assert_eq!(first_stats.links, 5);
}

#[test]
fn test_long_names_and_targets() {
    let long_dir = "a-directory-with-a-rather-long-name/".repeat(4);
    let original = format!("{long_dir}original.so");
    let copy = format!("{long_dir}copy.so");
    assert!(original.len() > 100);

    let content = vec![0x42u8; 32_000];
    let mut builder = Builder::new(Vec::new());
    append_file(&mut builder, &original, &content);
    append_file(&mut builder, &copy, &content);
    let input = builder.into_inner().unwrap();

    let (out, stats) = dedup(&input, &DedupOptions::default());
    assert_eq!(stats.links, 1);

    let entries = read_entries(&out);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].path, original);
    assert_eq!(entries[0].data, content);
    assert_eq!(entries[1].path, copy);
    assert_eq!(entries[1].entry_type, EntryType::Link);
    assert_eq!(entries[1].link_name.as_deref(), Some(original.as_str()));
}

#[test]
fn test_pax_path_is_the_link_target() {
    let content = vec![0x11u8; 12_345];
    let mut builder = Builder::new(Vec::new());
    append_pax(&mut builder, &[("path", "opt/app/lib/libpax.so")]);
    append_file(&mut builder, "truncated-name", &content);
    append_file(&mut builder, "opt/app/lib/libcopy.so", &content);
    let input = builder.into_inner().unwrap();

    let (out, stats) = dedup(&input, &DedupOptions::default());
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.links, 1);

    let entries = read_entries(&out);
    assert_eq!(entries[0].path, "opt/app/lib/libpax.so");
    assert_eq!(entries[1].path, "opt/app/lib/libcopy.so");
    assert_eq!(entries[1].link_name.as_deref(), Some("opt/app/lib/libpax.so"));
}

#[test]
fn test_malformed_header_stops_the_pass() {
    let mut builder = Builder::new(Vec::new());
    append_file(&mut builder, "a", &[1u8; 600]);
    append_file(&mut builder, "b", &[2u8; 700]);
    let valid = builder.into_inner().unwrap();

    // Replace the end-of-archive marker by a header that does not decode.
    let entries_len = valid.len() - 1024;
    let mut input = valid[..entries_len].to_vec();
    input.extend_from_slice(&[b'x'; 512]);
    input.extend_from_slice(&[0u8; 1024]);

    let mut out = Vec::new();
    let err = dedup_archive(input.as_slice(), &mut out, &DedupOptions::default()).unwrap_err();
    assert_matches!(err, DedupError::MalformedArchive(_));

    // Everything before the broken header was written, nothing after it.
    assert_eq!(out, valid[..entries_len]);
}

#[test]
fn test_truncated_content_is_a_read_failure() {
    let mut builder = Builder::new(Vec::new());
    append_file(&mut builder, "big", &[5u8; 50_000]);
    let mut input = builder.into_inner().unwrap();
    input.truncate(512 + 20_000);

    let mut out = Vec::new();
    let err = dedup_archive(input.as_slice(), &mut out, &DedupOptions::default()).unwrap_err();
    assert_matches!(err, DedupError::SourceReadFailure(_));
    assert!(out.is_empty());
}

#[test]
fn test_truncated_pass_through_is_a_read_failure() {
    let mut builder = Builder::new(Vec::new());
    append_file(&mut builder, "small", &[5u8; 5_000]);
    let mut input = builder.into_inner().unwrap();
    input.truncate(512 + 2_000);

    let mut out = Vec::new();
    let err = dedup_archive(input.as_slice(), &mut out, &DedupOptions::default()).unwrap_err();
    assert_matches!(err, DedupError::SourceReadFailure(_));
}

#[test]
fn test_spooling_to_disk() {
    let content: Vec<u8> = (0..300_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let mut builder = Builder::new(Vec::new());
    append_file(&mut builder, "spilled-1", &content);
    append_file(&mut builder, "spilled-2", &content);
    let input = builder.into_inner().unwrap();

    let options = DedupOptions::default().with_spool_limit(4096);
    let (out, stats) = dedup(&input, &options);
    assert_eq!(stats.links, 1);

    let entries = read_entries(&out);
    assert_eq!(entries[0].data, content);
    assert_eq!(entries[1].link_name.as_deref(), Some("spilled-1"));
}

#[test]
fn test_padding_is_written_as_zeros() {
    let mut builder = Builder::new(Vec::new());
    append_file(&mut builder, "etc/hostname", b"layer");
    let clean = builder.into_inner().unwrap();

    // Some writers leave stale bytes between the end of the content and the block boundary.
    let mut input = clean.clone();
    input[512 + 5..1024].fill(0xAA);

    let (out, stats) = dedup(&input, &DedupOptions::default());
    assert_eq!(stats.entries, 1);
    assert_eq!(out, clean);
    assert_eq!(read_entries(&out)[0].data, b"layer");
}

#[test]
fn test_reused_canonical_path_keeps_first_mapping() {
    let y = vec![b'y'; 12_000];
    let z = vec![b'z'; 12_000];
    let mut builder = Builder::new(Vec::new());
    append_file(&mut builder, "a", &y);
    append_file(&mut builder, "a", &z);
    append_file(&mut builder, "c", &y);
    let input = builder.into_inner().unwrap();

    // The index maps content to the first path that held it and is never rewound, so a later
    // entry replacing that path does not change where duplicates point.
    let (out, stats) = dedup(&input, &DedupOptions::default());
    assert_eq!(stats.entries, 3);
    assert_eq!(stats.unique_contents, 2);
    assert_eq!(stats.links, 1);

    let entries = read_entries(&out);
    assert_eq!(entries[1].data, z);
    assert_eq!(entries[2].entry_type, EntryType::Link);
    assert_eq!(entries[2].link_name.as_deref(), Some("a"));
}
