//! Sorting line-oriented text files.

use crate::extsort::{ExternalSorterBuilder, SortError};

use log::info;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Sorts the lines of the file at `path` in place, byte-wise.
///
/// At most `part_size` lines are held in memory while parts are spilled. The
/// sorted lines are then collected in full before the file is truncated, so a
/// failure while reading or merging leaves the file untouched.
///
/// The rewrite is neither atomic nor safe under concurrent access: a crash
/// while writing can leave the file truncated. Write to a temporary path and
/// rename it into place if that matters.
pub fn sort_file_in_place<P: AsRef<Path>>(path: P, part_size: usize) -> Result<(), SortError> {
    sort_file_in_place_by(path, part_size, |a: &String, b: &String| a.cmp(b))
}

/// Same as [`sort_file_in_place`], ordering lines with `cmp`.
pub fn sort_file_in_place_by<P, F>(path: P, part_size: usize, cmp: F) -> Result<(), SortError>
where
    P: AsRef<Path>,
    F: Fn(&String, &String) -> Ordering + Sync + Send + Copy,
{
    let path = path.as_ref();
    // Spill next to the file, on the same filesystem.
    let tmp_root = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let sorter = ExternalSorterBuilder::new()
        .with_part_size(part_size)
        .with_tmp_dir(tmp_root)
        .num_threads(1)
        .build()?;

    let lines = {
        let reader = BufReader::new(File::open(path)?);
        sorter
            .try_sort_by(reader.lines(), cmp)?
            .collect::<Result<Vec<String>, _>>()?
    };

    let mut writer = BufWriter::new(File::create(path)?);
    for line in &lines {
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;

    info!("sorted {} lines of {}", lines.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod test {
    use std::fs;

    use rand::seq::SliceRandom;
    use rstest::*;

    use super::{sort_file_in_place, sort_file_in_place_by};
    use crate::extsort::SortError;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[rstest]
    fn test_sort_file_in_place(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("input.txt");
        fs::write(&path, "3\n1\n2\n").unwrap();

        sort_file_in_place(&path, 1).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "1\n2\n3\n");
        let leftovers = fs::read_dir(tmp_dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[rstest]
    #[case(1)]
    #[case(10)]
    #[case(10_000)]
    fn test_sort_large_file(tmp_dir: tempfile::TempDir, #[case] part_size: usize) {
        let mut values: Vec<i64> = (-500..500).chain(0..200).collect();
        values.shuffle(&mut rand::thread_rng());
        let content: String = values.iter().map(|v| format!("{}\n", v)).collect();
        let path = tmp_dir.path().join("values.txt");
        fs::write(&path, content).unwrap();

        let mut golden: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        golden.sort();

        sort_file_in_place(&path, part_size).unwrap();

        let sorted: Vec<String> = fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(sorted, golden);
    }

    #[rstest]
    fn test_sort_file_numerically(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("numbers.txt");
        fs::write(&path, "10\n9\n100\n-1\n").unwrap();

        sort_file_in_place_by(&path, 2, |a: &String, b: &String| {
            a.parse::<i64>().unwrap().cmp(&b.parse::<i64>().unwrap())
        })
        .unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "-1\n9\n10\n100\n");
    }

    #[rstest]
    fn test_missing_trailing_newline_and_empty_file(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("text.txt");
        fs::write(&path, "pear\napple\nfig").unwrap();
        sort_file_in_place(&path, 2).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "apple\nfig\npear\n");

        fs::write(&path, "").unwrap();
        sort_file_in_place(&path, 2).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[rstest]
    fn test_invalid_utf8_leaves_file_untouched(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("binary.txt");
        let content = b"b\na\n\xff\xfe\nc\n".to_vec();
        fs::write(&path, &content).unwrap();

        let result = sort_file_in_place(&path, 1);

        assert!(matches!(result, Err(SortError::IO(_))));
        assert_eq!(fs::read(&path).unwrap(), content);
        assert_eq!(fs::read_dir(tmp_dir.path()).unwrap().count(), 1);
    }

    #[rstest]
    fn test_missing_file(tmp_dir: tempfile::TempDir) {
        let result = sort_file_in_place(tmp_dir.path().join("absent.txt"), 4);
        assert!(matches!(result, Err(SortError::IO(_))));
    }
}
