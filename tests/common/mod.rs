#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;

use simple_bank::mail::{EmailMessage, EmailSender};
use simple_bank::store::memory::MemoryBackend;
use simple_bank::store::{Account, CreateAccountParams, CreateUserParams, Store, User};

pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

pub fn memory_store() -> (Store, MemoryBackend) {
    let backend = MemoryBackend::new();
    (Store::new(Arc::new(backend.clone())), backend)
}

pub fn memory_store_with_lock_timeout(lock_timeout: Duration) -> (Store, MemoryBackend) {
    let backend = MemoryBackend::with_lock_timeout(lock_timeout);
    (Store::new(Arc::new(backend.clone())), backend)
}

pub fn random_user_params() -> CreateUserParams {
    let username = random_string(8);
    CreateUserParams {
        full_name: format!("User {}", username),
        hashed_password: "hashed-secret".to_string(),
        email: format!("{}@example.com", username),
        username,
    }
}

pub async fn create_random_user(store: &Store) -> User {
    store
        .queries()
        .create_user(random_user_params())
        .await
        .expect("create user")
}

pub async fn create_random_account(store: &Store, balance: i64) -> Account {
    let user = create_random_user(store).await;
    store
        .queries()
        .create_account(CreateAccountParams {
            owner: user.username,
            currency: "USD".to_string(),
            balance,
        })
        .await
        .expect("create account")
}

pub async fn balance(store: &Store, account_id: i64) -> i64 {
    store
        .queries()
        .get_account(account_id)
        .await
        .expect("get account")
        .balance
}

/// Mailer that keeps every message; fails the first `fail_times` sends
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<EmailMessage>>,
    fail_times: AtomicUsize,
}

impl RecordingMailer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(times: usize) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail_times: AtomicUsize::new(times),
        })
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailSender for RecordingMailer {
    async fn send_email(&self, message: &EmailMessage) -> anyhow::Result<()> {
        let remaining = self.fail_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_times.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("smtp: connection refused");
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}
