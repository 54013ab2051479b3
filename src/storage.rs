use std::{
    collections::BTreeMap,
    fmt, fs,
    io::{self, Write},
    path::{Component, Path, PathBuf},
    sync::RwLock,
};

use thiserror::Error;

/// 儲存操作可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Key is invalid: {0}")]
    InvalidKey(String),
    #[error("Key not found: {0}")]
    NotFound(String),
    #[error("Lock poisoned")]
    LockPoisoned,
    #[error("Record is corrupted: {0}")]
    Corrupted(String),
}

/// 儲存操作的結果類型，封裝 [`StorageError`]。
pub type Result<T> = std::result::Result<T, StorageError>;

/// 以斜線分隔 key 的位元組儲存介面。
pub trait Storage: Send + Sync + fmt::Debug {
    /// 讀取指定 key 的內容，不存在時回傳 `StorageError::NotFound`。
    fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// 寫入指定 key，必要時建立上層目錄。
    fn write(&self, key: &str, value: &[u8]) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool>;

    /// 預設方法：讀取 key，不存在時回傳 `None`。
    fn read_optional(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.read(key) {
            Ok(data) => Ok(Some(data)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// 私有工具，提供 key 正規化與驗證等輔助函式。
struct KeyUtils;

impl KeyUtils {
    /// 將 key 正規化為相對路徑，拒絕空 key、控制字元以及跳出根目錄的 `..`。
    fn normalize(key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("Empty key".to_string()));
        }
        if key.contains('\0') || key.contains('\n') || key.contains('\r') {
            return Err(StorageError::InvalidKey(format!(
                "Invalid characters in key: {}",
                key
            )));
        }
        if key.contains("//") || key.ends_with('/') {
            return Err(StorageError::InvalidKey(format!(
                "Empty path component in key: {}",
                key
            )));
        }

        let mut normalized = PathBuf::new();
        for component in Path::new(key).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(StorageError::InvalidKey(format!(
                            "Cannot use '..' to escape root directory: {}",
                            key
                        )));
                    }
                }
                Component::Normal(name) => {
                    let name = name.to_str().ok_or_else(|| {
                        StorageError::InvalidKey(format!("Non-UTF8 path component in: {}", key))
                    })?;
                    if name.contains('\\') {
                        return Err(StorageError::InvalidKey(format!(
                            "Invalid path component: {}",
                            name
                        )));
                    }
                    normalized.push(name);
                }
                Component::Prefix(_) => {
                    return Err(StorageError::InvalidKey(format!("Invalid path: {}", key)))
                }
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(StorageError::InvalidKey(format!("Key resolves to root: {}", key)));
        }
        Ok(normalized)
    }
}

/// 基於目錄的儲存實作，每個 key 對應根目錄下的一個檔案，權限為 0o600。
///
/// 寫入先寫入暫存檔再以 rename 取代，避免中途失敗留下半筆資料。
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        Self::create_private_dir(&root)?;
        Ok(Self { root })
    }

    fn create_private_dir(path: &Path) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(path)?;
        }
        #[cfg(not(unix))]
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(KeyUtils::normalize(key)?))
    }

    fn open_private(path: &Path) -> io::Result<fs::File> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.open(path)
    }
}

impl Storage for FileStorage {
    fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            Self::create_private_dir(parent)?;
        }

        let mut temp_path = path.clone().into_os_string();
        temp_path.push(".temp");
        let temp_path = PathBuf::from(temp_path);

        let mut file = Self::open_private(&temp_path)?;
        file.write_all(value)?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key)?.is_file())
    }
}

/// 基於記憶體的儲存實作，適用於測試與暫時性的工作階段。
#[derive(Debug, Default)]
pub struct MemStorage {
    data: RwLock<BTreeMap<PathBuf, Vec<u8>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = KeyUtils::normalize(key)?;
        self.data
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .get(&path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = KeyUtils::normalize(key)?;
        self.data
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .insert(path, value.to_vec());
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let path = KeyUtils::normalize(key)?;
        Ok(self
            .data
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .contains_key(&path))
    }
}
