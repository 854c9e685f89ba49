use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use clap_num::maybe_hex;
use exhume_body::{Body, BodySlice};
use log::{debug, error};
use ntfs_inspect::stream::MftIteratorOptions;
use ntfs_inspect::{Ntfs, Result};
use prettytable::{Table, row};
use serde_json::{Value, json};
use std::io::{Read, Seek};

fn main() {
    let matches = Command::new("ntfs_inspect")
        .version("0.1.0")
        .author("ForensicXlab")
        .about("Inspect NTFS metadata and content straight from volume bytes.")
        .arg(
            Arg::new("body")
                .short('b')
                .long("body")
                .value_parser(value_parser!(String))
                .required(true)
                .help("The path to the body to inspect."),
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
            Arg::new("file_id")
                .long("file")
                .value_parser(maybe_hex::<u64>)
                .help("Display the metadata about a specific MFT record."),
        )
        .arg(
            Arg::new("dir_entry")
                .short('d')
                .long("dir_entry")
                .requires("file_id")
                .action(ArgAction::SetTrue)
                .help("If --file is a directory, list its directory entries."),
        )
        .arg(
            Arg::new("find")
                .long("find")
                .requires("file_id")
                .value_parser(value_parser!(String))
                .help("Look a name up in the index of the --file directory."),
        )
        .arg(
            Arg::new("path")
                .long("path")
                .value_parser(value_parser!(String))
                .help("Resolve a path such as \\Windows\\notepad.exe from the root."),
        )
        .arg(
            Arg::new("search")
                .long("search")
                .value_parser(value_parser!(String))
                .help("Search the directory tree for a file name."),
        )
        .arg(
            Arg::new("mft")
                .long("mft")
                .action(ArgAction::SetTrue)
                .help("List every in-use record of the master file table."),
        )
        .arg(
            Arg::new("dump")
                .long("dump")
                .action(ArgAction::SetTrue)
                .requires("file_id")
                .help("Dump the file content to file_<ID>.bin (requires --file)"),
        )
        .arg(
            Arg::new("stream")
                .long("stream")
                .requires("dump")
                .value_parser(value_parser!(String))
                .help("Dump this named data stream instead of the default one."),
        )
        .arg(
            Arg::new("json")
                .short('j')
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Output certain structures (pbs, file, mft) in JSON format."),
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

    let level_filter = match matches
        .get_one::<String>("log_level")
        .map(String::as_str)
        .unwrap_or("info")
    {
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::new().filter_level(level_filter).init();

    let Some(file_path) = matches.get_one::<String>("body") else {
        error!("No body given.");
        return;
    };
    let auto = String::from("auto");
    let format = matches.get_one::<String>("format").unwrap_or(&auto);
    let offset = matches.get_one::<u64>("offset").copied().unwrap_or(0);
    let size = matches.get_one::<u64>("size").copied().unwrap_or(0);

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

    let mut filesystem = match Ntfs::new(&mut slice) {
        Ok(fs) => fs,
        Err(e) => {
            error!("Couldn't open NTFS: {}", e);
            return;
        }
    };

    if let Err(e) = run(&mut filesystem, &matches) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run<T: Read + Seek>(fs: &mut Ntfs<T>, matches: &ArgMatches) -> Result<()> {
    let json_output = matches.get_flag("json");

    if matches.get_flag("pbs") {
        if json_output {
            print_json(&fs.pbs.to_json());
        } else {
            println!("{}", fs.pbs.to_string());
        }
    }

    if matches.get_flag("mft") {
        let mut rows = Vec::new();
        for rec in fs.records(MftIteratorOptions::in_use())? {
            match rec {
                Ok(rec) => rows.push(rec),
                Err(e) if e.is_integrity() => error!("Skipping record: {}", e),
                Err(e) => return Err(e),
            }
        }
        if json_output {
            let arr: Vec<Value> = rows
                .iter()
                .map(|r| json!({"id": r.id, "name": r.primary_name(), "directory": r.is_dir()}))
                .collect();
            print_json(&json!({ "records": arr }));
        } else {
            let mut t = Table::new();
            t.add_row(row![b -> "Entry", "Seq", "Type", "Name"]);
            for r in rows {
                t.add_row(row![
                    r.id,
                    r.header.sequence_number,
                    if r.is_dir() { "dir" } else { "file" },
                    r.primary_name().unwrap_or_default()
                ]);
            }
            println!("{}", t);
        }
    }

    if let Some(path) = matches.get_one::<String>("path") {
        match fs.resolve_path(path)? {
            Some(rec) if json_output => print_json(&rec.to_json()),
            Some(rec) => println!("{}", rec.to_string()),
            None => println!("{} not found.", path),
        }
    }

    if let Some(name) = matches.get_one::<String>("search") {
        match fs.search(name)? {
            Some((path, entry)) if json_output => {
                print_json(&json!({ "path": path, "entry": entry.to_json() }))
            }
            Some((path, entry)) => println!("{}  {}", entry.file_id, path),
            None => println!("{} not found.", name),
        }
    }

    if let Some(file_id) = matches.get_one::<u64>("file_id").copied() {
        let file = fs.get_file_id(file_id)?;

        if matches.get_flag("dir_entry") {
            let entries = fs.list_dir(file_id)?;
            if json_output {
                let arr: Vec<Value> = entries.iter().map(|de| de.to_json()).collect();
                print_json(&json!({ "dir_entries": arr }));
            } else {
                for entry in entries {
                    println!("{}  {}", entry.file_id, entry.name);
                }
            }
        } else if let Some(name) = matches.get_one::<String>("find") {
            match fs.find_in_dir(file_id, name)? {
                Some(entry) if json_output => print_json(&entry.to_json()),
                Some(entry) => println!("{}  {}", entry.file_id, entry.name),
                None => println!("{} not found.", name),
            }
        } else if matches.get_flag("dump") {
            let stream = matches.get_one::<String>("stream").map(String::as_str);
            let data = fs.read_stream(&file, stream)?;
            let out_name = format!("file_{:X}.bin", file_id);
            match std::fs::write(&out_name, &data) {
                Ok(()) => println!("Dumped {} bytes to {}", data.len(), out_name),
                Err(e) => error!("Cannot write dump: {}", e),
            }
        } else if json_output {
            print_json(&file.to_json());
        } else {
            println!("{}", file.to_string());
        }
    }
    Ok(())
}

fn print_json(v: &Value) {
    match serde_json::to_string_pretty(v) {
        Ok(s) => println!("{}", s),
        Err(e) => error!("Error serializing to JSON: {}", e),
    }
}
