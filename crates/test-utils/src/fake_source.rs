use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use benchfleet::artifact::ArtifactSource;
use benchfleet::fs::mock::MockFileSystem;
use benchfleet::remote::BoxFuture;

#[derive(Debug, Default)]
struct State {
    size: Option<u64>,
    free: Option<u64>,
    fail_transfers: bool,
    fetches: Vec<String>,
}

/// `ArtifactSource` that "downloads" into a `MockFileSystem`.
#[derive(Debug, Clone)]
pub struct FakeArtifactSource {
    fs: MockFileSystem,
    state: Arc<Mutex<State>>,
}

impl FakeArtifactSource {
    /// Every artifact is 1 KiB and the disk has 1 GiB free.
    pub fn new(fs: MockFileSystem) -> Self {
        Self {
            fs,
            state: Arc::new(Mutex::new(State {
                size: Some(1024),
                free: Some(1 << 30),
                ..State::default()
            })),
        }
    }

    pub fn set_size(&self, size: Option<u64>) {
        self.state.lock().unwrap().size = size;
    }

    pub fn set_free_space(&self, free: Option<u64>) {
        self.state.lock().unwrap().free = free;
    }

    pub fn fail_transfers(&self, fail: bool) {
        self.state.lock().unwrap().fail_transfers = fail;
    }

    pub fn fetches(&self) -> Vec<String> {
        self.state.lock().unwrap().fetches.clone()
    }
}

impl ArtifactSource for FakeArtifactSource {
    fn remote_size<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Option<u64>> {
        let size = self.state.lock().unwrap().size;
        Box::pin(async move { size })
    }

    fn free_space(&self, _dir: &Path) -> Option<u64> {
        self.state.lock().unwrap().free
    }

    fn fetch<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let fail = {
                let mut state = self.state.lock().unwrap();
                state.fetches.push(url.to_string());
                state.fail_transfers
            };
            self.fs.add_file(dest, "partial");
            if fail {
                return Err(anyhow!("transfer interrupted"));
            }
            self.fs.add_file(dest, "trace bytes");
            Ok(())
        })
    }
}
