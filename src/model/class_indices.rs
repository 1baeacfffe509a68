//! クラス名とクラスインデックスの対応表
//!
//! 学習データのサブディレクトリ名を辞書順に並べ、0から順にインデックスを割り当てます。
//! 推論時には学習時と完全に同じ対応表を使う必要があるため、
//! `{name}_class_indices.json` として保存し、チェックサムをモデル成果物に埋め込みます。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{FreshError, Result};
use crate::model::model_storage::write_atomic;

/// 予測ラベルが対応表に存在しない場合の表示名
pub const UNKNOWN_LABEL: &str = "Unknown";

/// クラス名 ⇔ インデックスの全単射
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassIndexMapping {
    /// インデックス順のクラス名
    names: Vec<String>,
}

impl ClassIndexMapping {
    /// インデックス順のクラス名から作成
    pub fn from_names(names: Vec<String>) -> Result<Self> {
        if names.is_empty() {
            return Err(FreshError::Configuration("class list is empty".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for name in &names {
            if !seen.insert(name.as_str()) {
                return Err(FreshError::Configuration(format!(
                    "duplicate class name: {}",
                    name
                )));
            }
        }
        Ok(Self { names })
    }

    /// 学習データのルートからクラス一覧を構築
    ///
    /// サブディレクトリ名を辞書順で並べます。ファイルは無視します。
    pub fn from_directory(train_dir: &Path) -> Result<Self> {
        if !train_dir.is_dir() {
            return Err(FreshError::Configuration(format!(
                "training directory not found: {}",
                train_dir.display()
            )));
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(train_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let name = entry.file_name().to_str().map(str::to_string).ok_or_else(|| {
                    FreshError::Configuration(format!(
                        "class directory name is not valid UTF-8: {:?}",
                        entry.file_name()
                    ))
                })?;
                names.push(name);
            }
        }

        if names.is_empty() {
            return Err(FreshError::Configuration(format!(
                "no class directories in {}",
                train_dir.display()
            )));
        }
        names.sort();
        Self::from_names(names)
    }

    pub fn num_classes(&self) -> usize {
        self.names.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// インデックスから生のクラス名を取得
    pub fn name_of(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// クラス名からインデックスを取得
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// 保存形式（クラス名 → インデックス）
    pub fn to_table(&self) -> BTreeMap<String, usize> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect()
    }

    /// 保存形式から復元（インデックス → クラス名に反転）
    ///
    /// インデックスが 0..K で隙間なく揃っていない表はエラーです。
    pub fn from_table(table: &BTreeMap<String, usize>) -> Result<Self> {
        let mut names: Vec<Option<String>> = vec![None; table.len()];
        for (name, &index) in table {
            let slot = names.get_mut(index).ok_or_else(|| {
                FreshError::Configuration(format!(
                    "class index {} for '{}' is out of range 0..{}",
                    index,
                    name,
                    table.len()
                ))
            })?;
            if slot.is_some() {
                return Err(FreshError::Configuration(format!(
                    "class index {} is assigned twice",
                    index
                )));
            }
            *slot = Some(name.clone());
        }
        // 重複がなく件数が一致するので全て埋まっている
        Self::from_names(names.into_iter().flatten().collect())
    }

    /// 正規化したJSON表現
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_table())?)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let table: BTreeMap<String, usize> = serde_json::from_str(json)?;
        Self::from_table(&table)
    }

    /// 対応表のチェックサム（blake3、16進文字列）
    ///
    /// インデックス順のクラス名から計算するため、JSONの整形には依存しません。
    pub fn checksum(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for (i, name) in self.names.iter().enumerate() {
            hasher.update(&(i as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update(&[0]);
        }
        hasher.finalize().to_hex().to_string()
    }

    /// 対応表をファイルに保存（一時ファイル経由で置き換え）
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = self.to_json_string()?;
        write_atomic(path, json.as_bytes())?;
        tracing::info!("クラスインデックスを保存しました: {}", path.display());
        Ok(())
    }

    /// 対応表をファイルから読み込む
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            FreshError::ModelUnavailable(format!(
                "failed to read class indices {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&json)
    }
}

/// `{dir}/{name}_class_indices.json`
pub fn class_indices_path(model_dir: &Path, model_name: &str) -> PathBuf {
    model_dir.join(format!("{}_class_indices.json", model_name))
}

/// 表示用ラベル: アンダースコアを空白に置換し、各単語の先頭を大文字に
///
/// 大文字・小文字を持たない文字（空白、`-`、数字など）の直後を単語の先頭とみなします。
/// `"fresh_bananas"` → `"Fresh Bananas"`、`"fresh-apples"` → `"Fresh-Apples"`
pub fn format_label(raw: &str) -> String {
    let mut label = String::with_capacity(raw.len());
    let mut prev_cased = false;
    for c in raw.chars().map(|c| if c == '_' { ' ' } else { c }) {
        if prev_cased {
            label.extend(c.to_lowercase());
        } else {
            label.extend(c.to_uppercase());
        }
        prev_cased = c.is_lowercase() || c.is_uppercase();
    }
    label
}

/// 生のクラス名が「新鮮」を表すか（大文字小文字を区別しない部分一致）
pub fn is_fresh_label(raw: &str) -> bool {
    raw.to_lowercase().contains("fresh")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_from_directory_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for class in ["rotten_apples", "fresh_bananas", "fresh_apples"] {
            std::fs::create_dir(dir.path().join(class)).unwrap();
        }
        std::fs::write(dir.path().join("README.txt"), "ignored").unwrap();

        let mapping = ClassIndexMapping::from_directory(dir.path()).unwrap();
        assert_eq!(
            mapping.names(),
            &names(&["fresh_apples", "fresh_bananas", "rotten_apples"])[..]
        );
        assert_eq!(mapping.index_of("rotten_apples"), Some(2));
    }

    #[test]
    fn test_from_directory_missing_or_empty() {
        let dir = tempfile::tempdir().unwrap();
        let err = ClassIndexMapping::from_directory(&dir.path().join("train")).unwrap_err();
        assert!(matches!(err, FreshError::Configuration(_)));

        let err = ClassIndexMapping::from_directory(dir.path()).unwrap_err();
        assert!(matches!(err, FreshError::Configuration(_)));
    }

    #[test]
    fn test_table_inversion_recovers_names() {
        let mapping =
            ClassIndexMapping::from_names(names(&["fresh_apples", "fresh_oranges", "rotten_oranges"]))
                .unwrap();
        let restored = ClassIndexMapping::from_table(&mapping.to_table()).unwrap();
        assert_eq!(restored, mapping);
        for (i, name) in mapping.names().iter().enumerate() {
            assert_eq!(restored.name_of(i), Some(name.as_str()));
        }
    }

    #[test]
    fn test_from_table_rejects_gaps() {
        let mut table = BTreeMap::new();
        table.insert("a".to_string(), 0);
        table.insert("b".to_string(), 2);
        assert!(ClassIndexMapping::from_table(&table).is_err());

        let mut table = BTreeMap::new();
        table.insert("a".to_string(), 1);
        table.insert("b".to_string(), 1);
        assert!(ClassIndexMapping::from_table(&table).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = class_indices_path(dir.path(), "fruit");
        let mapping = ClassIndexMapping::from_names(names(&["fresh_apples", "rotten_apples"])).unwrap();
        mapping.save(&path).unwrap();

        let json = std::fs::read_to_string(&path).unwrap();
        assert_eq!(json, r#"{"fresh_apples":0,"rotten_apples":1}"#);
        assert_eq!(ClassIndexMapping::load(&path).unwrap(), mapping);
    }

    #[test]
    fn test_load_missing_is_model_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = ClassIndexMapping::load(&dir.path().join("none.json")).unwrap_err();
        assert!(matches!(err, FreshError::ModelUnavailable(_)));
    }

    #[test]
    fn test_checksum_depends_on_order() {
        let a = ClassIndexMapping::from_names(names(&["fresh_apples", "rotten_apples"])).unwrap();
        let b = ClassIndexMapping::from_names(names(&["rotten_apples", "fresh_apples"])).unwrap();
        assert_eq!(a.checksum(), a.clone().checksum());
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_format_label() {
        assert_eq!(format_label("fresh_bananas"), "Fresh Bananas");
        assert_eq!(format_label("rotten_apples"), "Rotten Apples");
        assert_eq!(format_label("FRESH_okra"), "Fresh Okra");
        assert_eq!(format_label("fresh-apples"), "Fresh-Apples");
        assert_eq!(format_label("rotten_2nd_batch"), "Rotten 2Nd Batch");
        assert_eq!(format_label("fresh__kiwi"), "Fresh  Kiwi");
    }

    #[test]
    fn test_is_fresh_label() {
        assert!(is_fresh_label("fresh_bananas"));
        assert!(is_fresh_label("FreshApples"));
        assert!(!is_fresh_label("rotten_apples"));
    }
}
