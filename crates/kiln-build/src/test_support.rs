//! Archive builders shared by the unit tests.

use flate2::Compression;
use flate2::write::GzEncoder;

fn append(builder: &mut tar::Builder<impl std::io::Write>, files: &[(&str, &str)]) {
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, content.as_bytes()).unwrap();
    }
}

/// Gzip-compressed tarball of regular files.
pub fn gzip_tar(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    append(&mut builder, files);
    builder.into_inner().unwrap().finish().unwrap()
}

/// Uncompressed tarball, shaped like an exported image filesystem.
pub fn plain_tar(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    append(&mut builder, files);
    builder.into_inner().unwrap()
}

/// Gzip tarball with a directory and a symlink next to `files`.
pub fn gzip_tar_with_specials(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));

    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_size(0);
    dir.set_mode(0o755);
    dir.set_cksum();
    builder.append_data(&mut dir, "Procfile.d/", std::io::empty()).unwrap();

    let mut link = tar::Header::new_gnu();
    link.set_entry_type(tar::EntryType::Symlink);
    link.set_size(0);
    link.set_mode(0o777);
    builder
        .append_link(&mut link, "tsuru.yml", "/etc/passwd")
        .unwrap();

    append(&mut builder, files);
    builder.into_inner().unwrap().finish().unwrap()
}
