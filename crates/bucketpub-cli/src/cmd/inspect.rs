//! `bucketpub inspect` - walk a local archive the way a run would, without a bus

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;

use bucketpub_core::{ContainerKind, JsonPath, archive, fmt_num, is_blank, json_stream};

use super::print_summary;
use crate::config::Config;

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Local .zip or .gz file
    pub path: PathBuf,

    /// Path of the record array inside the document, e.g. "results.*"
    #[arg(long)]
    pub array_path: Option<String>,

    /// Print the first N records to stdout
    #[arg(short = 'n', long, default_value_t = 0)]
    pub show: usize,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Tally {
    records: usize,
    blank: usize,
    document_bytes: u64,
}

/// Count records, echoing the first `show` of them to `out`.
fn walk(
    member: archive::ArchiveMember,
    path: JsonPath,
    show: usize,
    out: &mut impl Write,
) -> Result<Tally> {
    let mut stream = json_stream::parse(member, path);
    let mut tally = Tally::default();
    for item in stream.by_ref() {
        let value = item?;
        if is_blank(&value) {
            tally.blank += 1;
        }
        if tally.records < show {
            writeln!(out, "{value}")?;
        }
        tally.records += 1;
    }
    tally.document_bytes = stream.offset();
    Ok(tally)
}

pub fn run(args: InspectArgs, config: &Config) -> Result<ExitCode> {
    let array_path = args.array_path.as_deref().unwrap_or(&config.parser.array_path);
    let path = JsonPath::parse(array_path)?;

    let file = File::open(&args.path)
        .with_context(|| format!("failed to open {}", args.path.display()))?;
    let member = archive::open(Box::new(file))
        .with_context(|| format!("{} is not a readable archive", args.path.display()))?;
    let kind = member.kind();
    let name = member.name().unwrap_or("-").to_string();

    let start = Instant::now();
    let tally = walk(member, path.clone(), args.show, &mut std::io::stdout().lock())
        .with_context(|| format!("failed to read {}", args.path.display()))?;

    let container = match kind {
        ContainerKind::Zip => "zip",
        ContainerKind::Gzip => "gzip",
    };
    print_summary(
        "Archive",
        &[
            ("File", args.path.display().to_string()),
            ("Container", container.to_string()),
            ("Member", name),
            ("Array path", path.to_string()),
            ("Records", fmt_num(tally.records)),
            ("Blank (skipped on publish)", fmt_num(tally.blank)),
            ("Document bytes", fmt_num(tally.document_bytes as usize)),
            ("Elapsed", format!("{:.2}s", start.elapsed().as_secs_f64())),
        ],
    );
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn gz(doc: &str) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(doc.as_bytes()).unwrap();
        enc.finish().unwrap()
    }

    fn member(doc: &str) -> archive::ArchiveMember {
        archive::open(Box::new(std::io::Cursor::new(gz(doc)))).unwrap()
    }

    #[test]
    fn counts_records_and_blanks() {
        let doc = r#"{"meta":{"n":4},"results":[{"a":1},null,"",{"b":2}]}"#;
        let mut out = Vec::new();
        let tally = walk(member(doc), JsonPath::default(), 1, &mut out).unwrap();
        assert_eq!(tally.records, 4);
        assert_eq!(tally.blank, 2);
        assert_eq!(tally.document_bytes, doc.len() as u64);
        assert_eq!(String::from_utf8(out).unwrap(), "{\"a\":1}\n");
    }

    #[test]
    fn malformed_document_fails() {
        let mut out = Vec::new();
        let err = walk(member(r#"{"results":[1,}"#), JsonPath::default(), 0, &mut out).unwrap_err();
        assert!(err.to_string().starts_with("malformed JSON at byte"), "{err}");
    }

    #[test]
    fn inspect_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json.gz");
        std::fs::write(&path, gz(r#"{"data":[1,2,3]}"#)).unwrap();
        let args = InspectArgs {
            path,
            array_path: Some("data.*".into()),
            show: 0,
        };
        assert!(run(args, &Config::default()).is_ok());
    }

    #[test]
    fn missing_file_fails() {
        let args = InspectArgs {
            path: PathBuf::from("/nonexistent/bucketpub.zip"),
            array_path: None,
            show: 0,
        };
        assert!(run(args, &Config::default()).is_err());
    }
}
