// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn format_arg() -> Arg {
    Arg::new("format")
        .short('f')
        .long("format")
        .value_parser(["erofs", "tar-gzip"])
        .help("Content layer format [default: erofs, or tar-gzip with --no-integrity]")
}

fn no_integrity_arg() -> Arg {
    Arg::new("no-integrity")
        .long("no-integrity")
        .action(ArgAction::SetTrue)
        .help("Allow content layers without dm-verity")
}

fn root_arg() -> Arg {
    Arg::new("root")
        .long("root")
        .value_name("DIR")
        .help("Root of the packages, mounts and bundles directories")
}

fn build_cli() -> Command {
    Command::new("bolt")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Bolt Contributors")
        .about("Build, resolve and deploy layered bolt packages")
        .subcommand_required(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Log debug output, including every external command"),
        )
        .subcommand(
            Command::new("pack")
                .about("Pack a package config and a content archive into a package")
                .arg(Arg::new("config").required(true).help("Package configuration (package.json)"))
                .arg(Arg::new("content").required(true).help("Content as a tar or tar.gz archive"))
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .default_value(".")
                        .help("Directory the package is written to"),
                )
                .arg(format_arg())
                .arg(no_integrity_arg()),
        )
        .subcommand(
            Command::new("make")
                .about("Build a package from its <alias>.bolt.json recipe")
                .arg(Arg::new("alias").required(true).help("Recipe alias"))
                .arg(
                    Arg::new("directory")
                        .short('C')
                        .long("directory")
                        .default_value(".")
                        .help("Directory the recipe and package store searches start from"),
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .default_value(".")
                        .help("Directory the package is written to"),
                )
                .arg(format_arg())
                .arg(no_integrity_arg()),
        )
        .subcommand(
            Command::new("resolve")
                .about("Print the dependency closure of a package, dependencies first")
                .arg(
                    Arg::new("name")
                        .required(true)
                        .help("Package full name (<id>+<version>) or recipe alias"),
                )
                .arg(
                    Arg::new("directory")
                        .short('C')
                        .long("directory")
                        .default_value(".")
                        .help("Directory the package store search starts from"),
                )
                .arg(
                    Arg::new("store")
                        .long("store")
                        .value_name("DIR")
                        .help("Package store to use instead of searching for one"),
                ),
        )
        .subcommand(
            Command::new("diff")
                .about("Write the layer separating two OCI images")
                .arg(Arg::new("bottom").required(true).help("Bottom image (OCI layout as tar or tar.gz)"))
                .arg(Arg::new("top").required(true).help("Top image (OCI layout as tar or tar.gz)"))
                .arg(Arg::new("layer").required(true).help("Where the tar.gz layer is written")),
        )
        .subcommand(
            Command::new("install")
                .about("Install a package archive into the deployed-package directory")
                .arg(Arg::new("archive").required(true).help("Package archive (<id>+<version>.bolt)"))
                .arg(root_arg()),
        )
        .subcommand(
            Command::new("deploy")
                .about("Mount a deployed package and its dependencies into a runtime bundle")
                .arg(Arg::new("name").required(true).help("Package full name (<id>+<version>)"))
                .arg(root_arg()),
        )
        .subcommand(
            Command::new("teardown")
                .about("Unmount a deployed package's content layer and the bundles using it")
                .arg(Arg::new("name").required(true).help("Package full name (<id>+<version>)"))
                .arg(root_arg()),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("bolt.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");
}
