#![allow(dead_code)]
use std::{
    fs::{read_to_string, File},
    io::{LineWriter, Write},
    path::{Path, PathBuf},
};

use assert_fs::{prelude::*, TempDir};
use predicates::prelude::*;

use streamquant::alignment::{Alignment, AlignmentGroup, LibraryFormat};

// Creates correct path for input/output files
static FILE_IN: &'static str = "tests/test_files_in";
static SYM_IN: &'static str = "input";
static RFILE_NAME: &'static str = "file_list.txt";

#[derive(Debug, PartialEq, Copy, Clone)]
pub enum TestDir {
    Input,
    Output,
}

pub struct TestSetup {
    wd: TempDir,
}

impl TestSetup {
    pub fn setup() -> Self {
        let wd = assert_fs::TempDir::new().unwrap();
        wd.child(SYM_IN)
            .symlink_to_dir(
                Path::new(FILE_IN)
                    .canonicalize()
                    .expect("Could not link expected files"),
            )
            .unwrap();
        Self { wd }
    }

    pub fn get_wd(&self) -> String {
        self.wd.path().display().to_string()
    }

    pub fn file_path(&self, name: &str, file_type: TestDir) -> PathBuf {
        match file_type {
            TestDir::Input => {
                PathBuf::from(&format!("{}/{}/{}", self.wd.path().display(), SYM_IN, name))
            }
            TestDir::Output => self.wd.child(name).path().to_path_buf(),
        }
    }

    pub fn file_string(&self, name: &str, file_type: TestDir) -> String {
        self.file_path(name, file_type)
            .to_str()
            .expect("Could not unpack file path")
            .to_owned()
    }

    pub fn file_exists(&self, name_out: &str) -> bool {
        let predicate_fn = predicate::path::is_file();
        predicate_fn.eval(self.wd.child(name_out).path())
    }

    pub fn read_output(&self, name_out: &str) -> String {
        read_to_string(self.wd.child(name_out).path()).expect("Could not read output")
    }

    pub fn create_rfile(&self, libs: &[(&str, &str, &str)]) -> &str {
        // Create an rfile in the tmp dir
        let mut rfile = LineWriter::new(
            File::create(format!("{}/{}", self.get_wd(), RFILE_NAME))
                .expect("Could not write rfile"),
        );
        for (name, lib_type, hits) in libs {
            writeln!(
                rfile,
                "{}\t{}\t{}",
                name,
                lib_type,
                self.file_string(hits, TestDir::Input)
            )
            .unwrap();
        }
        RFILE_NAME
    }
}

// Columns of quant.sf keyed by transcript name
pub fn quant_rows(quant_sf: &str) -> Vec<(String, u32, f64, f64, f64)> {
    quant_sf
        .lines()
        .skip(1)
        .map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            (
                fields[0].to_string(),
                fields[1].parse().unwrap(),
                fields[2].parse().unwrap(),
                fields[3].parse().unwrap(),
                fields[4].parse().unwrap(),
            )
        })
        .collect()
}

// A fragment with unit score and no fragment length on each of `tids`
pub fn group_of(tids: &[u32]) -> AlignmentGroup {
    let format = LibraryFormat::parse("U").unwrap();
    AlignmentGroup::from_alignments(
        tids.iter()
            .map(|tid| Alignment::new(*tid, format, 1.0, 0))
            .collect(),
    )
}
