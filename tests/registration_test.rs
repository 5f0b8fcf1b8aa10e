//! User registration and email verification

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use common::*;
use simple_bank::store::{
    BoxError, ConstraintCode, CreateVerifyEmailParams, StoreError, User,
};
use simple_bank::user::{
    RegisterUserRequest, RegistrationError, UserService, VerifyEmailTxParams, check_password,
    create_user_tx,
};
use simple_bank::worker::{
    MemoryQueue, PayloadSendVerifyEmail, QueueClass, QueueTaskDistributor,
    TASK_SEND_VERIFY_EMAIL,
};

fn service() -> (UserService, Arc<MemoryQueue>, simple_bank::Store) {
    let (store, _) = memory_store();
    let queue = Arc::new(MemoryQueue::new());
    let distributor = Arc::new(QueueTaskDistributor::new(queue.clone()));
    (UserService::new(store.clone(), distributor), queue, store)
}

#[tokio::test]
async fn test_callback_sees_user_and_commits() {
    let (store, _) = memory_store();
    let arg = random_user_params();
    let seen: Arc<Mutex<Option<User>>> = Arc::new(Mutex::new(None));

    let recorder = seen.clone();
    let user = create_user_tx(&store, arg.clone(), move |user| {
        Box::pin(async move {
            *recorder.lock().unwrap() = Some(user);
            Ok(())
        })
    })
    .await
    .unwrap();

    assert_eq!(user.username, arg.username);
    assert!(!user.is_email_verified);
    assert_eq!(seen.lock().unwrap().as_ref(), Some(&user));
    assert_eq!(store.queries().get_user(&arg.username).await.unwrap(), user);
}

#[tokio::test]
async fn test_callback_failure_rolls_back_user() {
    let (store, _) = memory_store();
    let arg = random_user_params();

    let err = create_user_tx(&store, arg.clone(), |_user| {
        Box::pin(async move { Err(BoxError::from("queue is full")) })
    })
    .await
    .unwrap_err();

    assert!(matches!(err, StoreError::Callback(_)));
    assert_eq!(err.code(), "CALLBACK_FAILED");
    assert!(
        store
            .queries()
            .get_user(&arg.username)
            .await
            .unwrap_err()
            .is_not_found()
    );
}

#[tokio::test]
async fn test_create_user_enqueues_verify_email() {
    let (service, queue, _) = service();
    let arg = random_user_params();
    let before = Utc::now();

    let user = service.create_user(arg).await.unwrap();

    let pending = queue.pending(QueueClass::Critical);
    assert_eq!(pending.len(), 1);
    let task = &pending[0];
    assert_eq!(task.task_type, TASK_SEND_VERIFY_EMAIL);
    assert_eq!(task.max_retry, 10);
    assert!(task.next_process_at >= before + chrono::Duration::seconds(9));

    let payload: PayloadSendVerifyEmail = serde_json::from_slice(&task.payload).unwrap();
    assert_eq!(payload.username, user.username);
}

#[tokio::test]
async fn test_queue_outage_rolls_back_registration() {
    let (service, queue, store) = service();
    queue.set_unavailable(Some("connection refused"));
    let arg = random_user_params();

    let err = service.create_user(arg.clone()).await.unwrap_err();

    assert_eq!(err.code(), "CALLBACK_FAILED");
    assert!(
        store
            .queries()
            .get_user(&arg.username)
            .await
            .unwrap_err()
            .is_not_found()
    );
    queue.set_unavailable(None);
    assert!(queue.tasks().is_empty());
}

#[tokio::test]
async fn test_duplicate_username_enqueues_nothing() {
    let (service, queue, _) = service();
    let arg = random_user_params();
    service.create_user(arg.clone()).await.unwrap();

    let err = service
        .create_user(simple_bank::store::CreateUserParams {
            email: format!("other-{}", arg.email),
            ..arg
        })
        .await
        .unwrap_err();

    assert_eq!(err.constraint_code(), Some(ConstraintCode::UniqueViolation));
    assert_eq!(queue.tasks().len(), 1);
}

#[tokio::test]
async fn test_register_hashes_password() {
    let (service, _, _) = service();
    let username = random_string(8);

    let user = service
        .register(RegisterUserRequest {
            username: username.clone(),
            full_name: "Hashed User".to_string(),
            email: format!("{}@example.com", username),
            password: "secret123".to_string(),
        })
        .await
        .unwrap();

    assert_ne!(user.hashed_password, "secret123");
    assert!(check_password("secret123", &user.hashed_password).is_ok());
}

#[tokio::test]
async fn test_register_rejects_short_password() {
    let (service, queue, store) = service();
    let username = random_string(8);

    let err = service
        .register(RegisterUserRequest {
            username: username.clone(),
            full_name: "Short".to_string(),
            email: format!("{}@example.com", username),
            password: "abc".to_string(),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, RegistrationError::InvalidPassword(_)));
    assert_eq!(err.code(), "INVALID_PASSWORD");
    assert!(store.queries().get_user(&username).await.is_err());
    assert!(queue.tasks().is_empty());
}

#[tokio::test]
async fn test_verify_email_marks_user_verified_once() {
    let (service, _, store) = service();
    let user = service.create_user(random_user_params()).await.unwrap();
    let code = store
        .queries()
        .create_verify_email(CreateVerifyEmailParams {
            username: user.username.clone(),
            email: user.email.clone(),
            secret_code: random_string(32),
        })
        .await
        .unwrap();

    let err = service
        .verify_email(VerifyEmailTxParams {
            email_id: code.id,
            secret_code: "wrong".to_string(),
        })
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(!store.queries().get_user(&user.username).await.unwrap().is_email_verified);

    let params = VerifyEmailTxParams {
        email_id: code.id,
        secret_code: code.secret_code.clone(),
    };
    let result = service.verify_email(params.clone()).await.unwrap();
    assert!(result.user.is_email_verified);
    assert!(result.verify_email.is_used);
    assert_eq!(result.verify_email.id, code.id);

    let err = service.verify_email(params).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_delayed_task_not_delivered_early() {
    let (service, queue, _) = service();
    service.create_user(random_user_params()).await.unwrap();

    let leased = simple_bank::worker::TaskQueue::dequeue(
        queue.as_ref(),
        QueueClass::Critical,
        Duration::from_secs(30),
    )
    .await
    .unwrap();
    assert!(leased.is_none());
}
