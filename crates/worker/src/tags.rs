//! Tag naming and datum content hashing.
//!
//! Tag formats are part of the wire contract with the coordinator and with
//! peer workers; they must stay bit-stable.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::task::Input;

/// Suffix distinguishing a datum's stats tree from its output tree.
pub const STATS_TAG_SUFFIX: &str = "_stats";

fn job_tag_prefix(job_id: &str) -> String {
    format!("job-{job_id}")
}

/// Tag of the recovered-datum list published by one subtask.
pub fn job_recovered_datums_tag(job_id: &str, subtask_id: &str) -> String {
    format!("{}-recovered-{}", job_tag_prefix(job_id), subtask_id)
}

/// Tag of the merged stats chunk published by one subtask.
pub fn job_chunk_stats_tag(job_id: &str, subtask_id: &str) -> String {
    format!("{}-chunk-stats-{}", job_tag_prefix(job_id), subtask_id)
}

/// Tag of the merged output chunk published by one subtask.
pub fn job_chunk_tag(job_id: &str, subtask_id: &str) -> String {
    format!("{}-chunk-{}", job_tag_prefix(job_id), subtask_id)
}

/// Tag of the stats tree derived from a datum's output tag.
pub fn stats_tag(tag: &str) -> String {
    format!("{tag}{STATS_TAG_SUFFIX}")
}

fn update_framed(hasher: &mut Sha256, part: &str) {
    hasher.update((part.len() as u64).to_le_bytes());
    hasher.update(part.as_bytes());
}

/// Content hash of a datum: a pure function of the pipeline identity and the
/// ordered input list.
pub fn hash_datum(pipeline_name: &str, salt: &str, inputs: &[Input]) -> String {
    let mut hasher = Sha256::new();
    update_framed(&mut hasher, pipeline_name);
    update_framed(&mut hasher, salt);
    for input in inputs {
        update_framed(&mut hasher, &input.name);
        update_framed(&mut hasher, &input.file_info.file.path);
        update_framed(&mut hasher, &input.file_info.hash);
    }
    format!("{:x}", hasher.finalize())
}

/// Stable id of a datum, independent of pipeline identity.
pub fn datum_id(inputs: &[Input]) -> String {
    let mut hasher = Sha256::new();
    for input in inputs {
        update_framed(&mut hasher, &input.name);
        update_framed(&mut hasher, &input.file_info.file.path);
        update_framed(&mut hasher, &input.file_info.hash);
    }
    format!("{:x}", hasher.finalize())
}

/// Random dashless key for local cache entries.
pub fn random_key() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Commit, File, FileInfo};

    fn input(name: &str, path: &str, hash: &str) -> Input {
        Input {
            name: name.to_string(),
            file_info: FileInfo {
                file: File {
                    commit: Commit {
                        id: "c1".to_string(),
                    },
                    path: path.to_string(),
                },
                hash: hash.to_string(),
                size_bytes: 0,
            },
        }
    }

    #[test]
    fn job_tag_formats_are_stable() {
        assert_eq!(job_chunk_tag("j1", "s1"), "job-j1-chunk-s1");
        assert_eq!(job_chunk_stats_tag("j1", "s1"), "job-j1-chunk-stats-s1");
        assert_eq!(job_recovered_datums_tag("j1", "s1"), "job-j1-recovered-s1");
        assert_eq!(stats_tag("abc"), "abc_stats");
    }

    #[test]
    fn hash_datum_depends_on_identity_and_input_order() {
        let a = input("A", "a.txt", "h1");
        let b = input("B", "b.txt", "h2");

        let base = hash_datum("p", "salt", &[a.clone(), b.clone()]);
        assert_eq!(base, hash_datum("p", "salt", &[a.clone(), b.clone()]));
        assert_ne!(base, hash_datum("p", "salt", &[b.clone(), a.clone()]));
        assert_ne!(base, hash_datum("p2", "salt", &[a.clone(), b.clone()]));
        assert_ne!(base, hash_datum("p", "salt2", &[a.clone(), b.clone()]));
    }

    #[test]
    fn datum_id_ignores_pipeline_identity() {
        let a = input("A", "a.txt", "h1");
        assert_eq!(datum_id(&[a.clone()]), datum_id(&[a.clone()]));
        assert_ne!(datum_id(&[a.clone()]), hash_datum("p", "s", &[a]));
    }

    #[test]
    fn random_keys_are_unique_and_dashless() {
        let k1 = random_key();
        let k2 = random_key();
        assert_ne!(k1, k2);
        assert!(!k1.contains('-'));
    }
}
