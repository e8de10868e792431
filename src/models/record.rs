use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 记录来源（文件夹 + 文件名）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default, rename = "source_folder")]
    pub folder: String,
    #[serde(default, rename = "source_file")]
    pub file: String,
}

/// 待加载的记录（尚未分配索引）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSeed {
    pub title: String,
    #[serde(rename = "abstract", default)]
    pub abstract_text: String,
    /// 原始条目，被判定为相关时原样写入结果文件
    pub entry: String,
    #[serde(flatten)]
    pub provenance: Provenance,
}

/// 一篇待判定的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// 从 1 开始的索引，在一次运行内唯一且稳定
    pub index: usize,
    pub title: String,
    pub abstract_text: String,
    pub raw_entry: String,
    pub provenance: Provenance,
}

impl Record {
    pub fn new(index: usize, seed: RecordSeed) -> Self {
        Self {
            index,
            title: seed.title,
            abstract_text: seed.abstract_text,
            raw_entry: seed.entry,
            provenance: seed.provenance,
        }
    }
}

/// 本次运行的工作集：索引 -> 记录
#[derive(Debug, Clone, Default)]
pub struct RecordSet {
    records: BTreeMap<usize, Record>,
}

impl RecordSet {
    /// 按输入顺序分配 1..=N 的连续索引
    pub fn from_seeds(seeds: impl IntoIterator<Item = RecordSeed>) -> Self {
        let records = seeds
            .into_iter()
            .enumerate()
            .map(|(i, seed)| (i + 1, Record::new(i + 1, seed)))
            .collect();
        Self { records }
    }

    /// 使用记录自带的索引
    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.index, r)).collect(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&Record> {
        self.records.get(&index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(title: &str) -> RecordSeed {
        RecordSeed {
            title: title.to_string(),
            abstract_text: String::new(),
            entry: format!("@article{{{}}}", title),
            provenance: Provenance::default(),
        }
    }

    #[test]
    fn test_from_seeds_assigns_dense_indices() {
        let set = RecordSet::from_seeds(vec![seed("a"), seed("b"), seed("c")]);
        assert_eq!(set.len(), 3);
        let indices: Vec<_> = set.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(set.get(2).unwrap().title, "b");
        assert!(set.get(0).is_none());
        assert!(set.get(4).is_none());
    }

    #[test]
    fn test_seed_deserializes_source_fields() {
        let json = r#"{
            "title": "T",
            "abstract": "A",
            "entry": "@inproceedings{x}",
            "source_folder": "CHI",
            "source_file": "CHI2016.bib"
        }"#;
        let seed: RecordSeed = serde_json::from_str(json).unwrap();
        assert_eq!(seed.abstract_text, "A");
        assert_eq!(seed.provenance.folder, "CHI");
        assert_eq!(seed.provenance.file, "CHI2016.bib");
    }
}
