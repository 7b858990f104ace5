use clap::{Arg, ArgAction, Command, value_parser};
use clap_num::maybe_hex;
use exhume_body::{Body, BodySlice};
use log::{debug, error};
use ntfs_sift::dent::NameFlags;
use ntfs_sift::inode::MetaFlags;
use ntfs_sift::stream::FileWalkFlags;
use ntfs_sift::{NTFS, WalkControl};
use prettytable::{Table, row};
use serde_json::{Value, json};
use std::io::{Read, Seek, Write};

fn parse_range(raw: &str) -> Option<(u64, u64)> {
    let parse = |s: &str| maybe_hex::<u64>(s.trim()).ok();
    match raw.split_once('-') {
        Some((a, b)) => Some((parse(a)?, parse(b)?)),
        None => parse(raw).map(|v| (v, v)),
    }
}

fn list_inodes<T: Read + Seek>(fs: &mut NTFS<T>, start: u64, end: u64, json_output: bool) {
    let mut rows = Vec::new();
    let mut table = Table::new();
    table.add_row(row!["Entry", "Seq", "Flags", "Type", "Size", "Name"]);
    let r = fs.inode_walk(start, end, MetaFlags::empty(), |rec, flags| {
        let name = rec.names.first().map(|n| n.name.clone()).unwrap_or_default();
        if json_output {
            rows.push(json!({
                "entry": rec.addr,
                "seq": rec.seq,
                "flags": format!("{:?}", flags),
                "is_dir": rec.is_dir,
                "size": rec.size,
                "name": name,
            }));
        } else {
            table.add_row(row![
                rec.addr,
                rec.seq,
                format!("{:?}", flags),
                if rec.is_dir { "d" } else { "r" },
                rec.size,
                name
            ]);
        }
        WalkControl::Continue
    });
    if let Err(e) = r {
        error!("Record walk failed: {}", e);
    }
    if json_output {
        let out = json!({ "records": rows });
        println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
    } else {
        table.printstd();
    }
}

fn list_dir<T: Read + Seek>(fs: &mut NTFS<T>, inum: u64, flags: NameFlags, json_output: bool) {
    let mut entries: Vec<Value> = Vec::new();
    let r = fs.dir_walk(inum, flags, |de| {
        if json_output {
            let mut v = serde_json::to_value(de).unwrap_or_else(|_| json!({}));
            // the full record is available through --file
            if let Some(obj) = v.as_object_mut() {
                obj.remove("record");
            }
            entries.push(v);
        } else {
            let state = if de.flags.contains(NameFlags::UNALLOC) {
                "*"
            } else {
                " "
            };
            let kind = if de.is_dir { "d/d" } else { "r/r" };
            println!("{} {} {}:\t{}{}", kind, state, de.inum, de.path, de.name);
        }
        WalkControl::Continue
    });
    if let Err(e) = r {
        error!("Directory walk failed: {}", e);
    }
    if json_output {
        let out = json!({ "dir_entries": entries });
        println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
    }
}

fn cat_file<T: Read + Seek>(fs: &mut NTFS<T>, inum: u64, slack: bool) {
    let rec = match fs.inode_lookup(inum) {
        Ok(r) => r,
        Err(e) => {
            error!("Cannot load entry {}: {}", inum, e);
            return;
        }
    };
    let mut flags = FileWalkFlags::empty();
    if slack {
        flags |= FileWalkFlags::SLACK;
    }
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let r = fs.file_walk(&rec, None, None, flags, |chunk| match chunk.data {
        Some(data) => match out.write_all(data) {
            Ok(()) => WalkControl::Continue,
            Err(e) => WalkControl::Error(e.to_string()),
        },
        None => WalkControl::Continue,
    });
    if let Err(e) = r {
        error!("Cannot read entry {}: {}", inum, e);
    }
    let _ = out.flush();
}

fn main() {
    let matches = Command::new("ntfs_sift")
        .version("0.1.0")
        .author("ForensicXlab")
        .about("Walk the metadata, directories and content of an NTFS file system.")
        .arg(
            Arg::new("body")
                .short('b')
                .long("body")
                .value_parser(value_parser!(String))
                .required(true)
                .help("The path to the body to analyse."),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_parser(value_parser!(String))
                .required(false)
                .help("The format of the file, either 'raw' or 'ewf'."),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .value_parser(maybe_hex::<u64>)
                .required(true)
                .help("The NTFS partition starts at address (decimal or hex)."),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_parser(maybe_hex::<u64>)
                .required(true)
                .help("The size of the NTFS partition in sectors (decimal or hex)."),
        )
        .arg(
            Arg::new("pbs")
                .long("pbs")
                .action(ArgAction::SetTrue)
                .help("Display the partition boot sector information."),
        )
        .arg(
            Arg::new("inodes")
                .long("inodes")
                .value_parser(value_parser!(String))
                .help("List the MFT entries in START-END (decimal or hex)."),
        )
        .arg(
            Arg::new("file_id")
                .long("file")
                .value_parser(maybe_hex::<u64>)
                .help("Display the metadata of one MFT entry."),
        )
        .arg(
            Arg::new("dir_id")
                .long("dir")
                .value_parser(maybe_hex::<u64>)
                .help("List the entries of a directory."),
        )
        .arg(
            Arg::new("recurse")
                .short('r')
                .long("recurse")
                .requires("dir_id")
                .action(ArgAction::SetTrue)
                .help("Descend into subdirectories (requires --dir)."),
        )
        .arg(
            Arg::new("deleted")
                .long("deleted")
                .requires("dir_id")
                .action(ArgAction::SetTrue)
                .help("Only list deleted entries recovered from index slack (requires --dir)."),
        )
        .arg(
            Arg::new("cat_id")
                .long("cat")
                .value_parser(maybe_hex::<u64>)
                .help("Write the default data stream of an MFT entry to stdout."),
        )
        .arg(
            Arg::new("slack")
                .long("slack")
                .requires("cat_id")
                .action(ArgAction::SetTrue)
                .help("Include the slack space after the content (requires --cat)."),
        )
        .arg(
            Arg::new("path_id")
                .long("path")
                .value_parser(maybe_hex::<u64>)
                .help("Print every path leading to an MFT entry."),
        )
        .arg(
            Arg::new("json")
                .short('j')
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Output structures in JSON format."),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("log-level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info")
                .help("Set the log verbosity level"),
        )
        .get_matches();

    // Initialize logger.
    let log_level_str = matches
        .get_one::<String>("log_level")
        .map(String::as_str)
        .unwrap_or("info");
    let level_filter = match log_level_str {
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "info" => log::LevelFilter::Info,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::new().filter_level(level_filter).init();

    let Some(file_path) = matches.get_one::<String>("body") else {
        return;
    };
    let auto = String::from("auto");
    let format = matches.get_one::<String>("format").unwrap_or(&auto);
    let offset = matches.get_one::<u64>("offset").copied().unwrap_or(0);
    let size = matches.get_one::<u64>("size").copied().unwrap_or(0);
    let json_output = matches.get_flag("json");

    let mut body = Body::new(file_path.to_owned(), format);
    debug!("Created Body from '{}'", file_path);

    let partition_size = size * body.get_sector_size() as u64;
    let mut slice = match BodySlice::new(&mut body, offset, partition_size) {
        Ok(sl) => sl,
        Err(e) => {
            error!("Could not create BodySlice: {}", e);
            return;
        }
    };

    let mut filesystem = match NTFS::new(&mut slice) {
        Ok(fs) => fs,
        Err(e) => {
            error!("Couldn't open NTFS: {}", e);
            return;
        }
    };

    if matches.get_flag("pbs") {
        if json_output {
            match serde_json::to_string_pretty(&filesystem.pbs.to_json()) {
                Ok(s) => println!("{}", s),
                Err(e) => error!("Error serializing PBS to JSON: {}", e),
            }
        } else {
            println!("{}", filesystem.pbs.to_string());
        }
    }

    if let Some(raw) = matches.get_one::<String>("inodes") {
        match parse_range(raw) {
            Some((start, end)) => list_inodes(&mut filesystem, start, end, json_output),
            None => error!("Invalid record range '{}', expected START-END", raw),
        }
    }

    if let Some(inum) = matches.get_one::<u64>("file_id").copied() {
        match filesystem.inode_lookup(inum) {
            Ok(rec) => {
                if json_output {
                    println!("{}", rec.to_json());
                } else {
                    println!("{}", rec.to_string());
                }
            }
            Err(e) => error!("Cannot load entry {}: {}", inum, e),
        }
    }

    if let Some(inum) = matches.get_one::<u64>("dir_id").copied() {
        let mut flags = if matches.get_flag("deleted") {
            NameFlags::UNALLOC
        } else {
            NameFlags::ALLOC | NameFlags::UNALLOC
        };
        if matches.get_flag("recurse") {
            flags |= NameFlags::RECURSE;
        }
        list_dir(&mut filesystem, inum, flags, json_output);
    }

    if let Some(inum) = matches.get_one::<u64>("cat_id").copied() {
        cat_file(&mut filesystem, inum, matches.get_flag("slack"));
    }

    if let Some(inum) = matches.get_one::<u64>("path_id").copied() {
        match filesystem.find_path(inum, None) {
            Ok(paths) => {
                if json_output {
                    let out = json!({ "paths": paths });
                    println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
                } else {
                    for p in paths {
                        let state = if p.allocated { "" } else { " (deleted)" };
                        println!("{}{}", p.path, state);
                    }
                }
            }
            Err(e) => error!("Cannot resolve entry {}: {}", inum, e),
        }
    }

    if let Some(msg) = filesystem.last_error() {
        debug!("last error: {}", msg);
    }
}
