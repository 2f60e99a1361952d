//! End-to-end tests against a real PHP interpreter.
//!
//! Tests marked `#[ignore]` need a `php` binary on PATH; run them with:
//! `cargo test --test bridge -- --ignored`
//!
//! Environment variables:
//! - TEST_PHP_CLI: interpreter to use (default: php)

use php_world::{Error, HostFn, PhpWorld, Settings, StdoutMode, Value};

fn php_settings() -> Settings {
    // RUST_LOG=php_world=debug surfaces the handshake and dispatch trail.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let mut settings = Settings::default();
    if let Ok(cli) = std::env::var("TEST_PHP_CLI") {
        settings.php_cli_name = cli.split_whitespace().map(str::to_string).collect();
    }
    settings
}

// =============================================================================
// No interpreter required
// =============================================================================

#[tokio::test]
async fn test_missing_interpreter_latches_until_terminate() {
    let mut php = PhpWorld::new(Settings {
        php_cli_name: vec!["php-world-no-such-binary".to_string()],
        ..Settings::default()
    });

    let err = php.constant("PHP_INT_SIZE").await.unwrap_err();
    assert!(matches!(err, Error::Io(_)), "spawn failure surfaces: {}", err);

    // Until terminate, operations fail fast with the latched error.
    let err = php.constant("PHP_INT_SIZE").await.unwrap_err();
    assert!(
        err.to_string().contains("previously failed"),
        "latched: {}",
        err
    );

    // terminate clears the latch; the next operation attempts a fresh spawn.
    php.terminate().await;
    let err = php.constant("PHP_INT_SIZE").await.unwrap_err();
    assert!(matches!(err, Error::Io(_)), "fresh attempt: {}", err);
}

#[tokio::test]
async fn test_invalid_usage_is_synchronous() {
    // Raised before any interpreter is spawned.
    let mut php = PhpWorld::new(Settings {
        php_cli_name: vec!["php-world-no-such-binary".to_string()],
        ..Settings::default()
    });
    assert!(matches!(
        php.var("a b").get().await,
        Err(Error::InvalidUsage(_))
    ));
    assert!(matches!(
        php.class("No Spaces").construct(&[]).await,
        Err(Error::InvalidUsage(_))
    ));
}

// =============================================================================
// Real interpreter
// =============================================================================

#[tokio::test]
#[ignore = "requires a php binary on PATH"]
async fn test_constant_read() {
    let mut php = PhpWorld::new(php_settings());
    let v = php.constant("PHP_INT_SIZE").await.unwrap();
    assert_eq!(v, Value::Int(8));
    assert_eq!(php.terminate().await, 0);
}

#[tokio::test]
#[ignore = "requires a php binary on PATH"]
async fn test_variable_round_trip() {
    let mut php = PhpWorld::new(php_settings());
    php.var("var")
        .set(serde_json::json!({"a": {"b": 1}}))
        .await
        .unwrap();
    let v = php.var("var").path("a").path("b").get().await.unwrap();
    assert_eq!(v, Value::Int(1));

    php.var("var").path("a").path("b").set(2).await.unwrap();
    let v = php.var("var").path("a").path("b").get().await.unwrap();
    assert_eq!(v, Value::Int(2));

    php.var("var").unset().await.unwrap();
    let v = php.var("var").get().await.unwrap();
    assert_eq!(v, Value::Null);
    php.terminate().await;
}

#[tokio::test]
#[ignore = "requires a php binary on PATH"]
async fn test_construct_and_method_call() {
    let mut php = PhpWorld::new(php_settings());
    let obj = php
        .class("ArrayObject")
        .construct(&[vec!["x", "y", "z"].into()])
        .await
        .unwrap();
    assert_eq!(obj.class_name(), Some("ArrayObject"));
    let n = php.obj(&obj).call("count", &[]).await.unwrap();
    assert_eq!(n, Value::Int(3));
    php.drop_object(obj).await.unwrap();
    php.terminate().await;
}

#[tokio::test]
#[ignore = "requires a php binary on PATH"]
async fn test_eval_and_functions() {
    let mut php = PhpWorld::new(php_settings());
    assert_eq!(php.eval("return 2 + 2;").await.unwrap(), Value::Int(4));

    let v = php.func("str_repeat").call(&["ab".into(), 3.into()]).await.unwrap();
    assert_eq!(v, Value::Str("ababab".to_string()));

    let v = php.func("strrev").call(&["dlrow".into()]).await.unwrap();
    assert_eq!(v, Value::Str("world".to_string()));
    php.terminate().await;
}

#[tokio::test]
#[ignore = "requires a php binary on PATH"]
async fn test_interpreter_error_mapping() {
    let mut php = PhpWorld::new(php_settings());
    let err = php.eval("throw new Exception('kaboom');").await.unwrap_err();
    match err {
        Error::Interpreter(e) => {
            assert_eq!(e.message, "kaboom");
            assert!(e.line_number >= 1);
        }
        other => panic!("unexpected error {:?}", other),
    }
    // The channel survives a script error.
    assert_eq!(php.eval("return 1;").await.unwrap(), Value::Int(1));
    php.terminate().await;
}

#[tokio::test]
#[ignore = "requires a php binary on PATH"]
async fn test_reverse_call() {
    let mut php = PhpWorld::new(php_settings());
    php.globals().define(
        "add",
        HostFn::from_sync(|args| {
            let a = args.first().and_then(Value::as_i64).unwrap_or(0);
            let b = args.get(1).and_then(Value::as_i64).unwrap_or(0);
            Ok(Value::Int(a + b))
        }),
    );
    php.globals()
        .define("fail", HostFn::from_sync(|_| Err("boom".to_string())));

    let v = php.eval("return RustWorld::add(19, 23);").await.unwrap();
    assert_eq!(v, Value::Int(42));

    // A host-side throw becomes a PHP exception with the same message.
    let v = php
        .eval("try { RustWorld::fail(); return 'no'; } catch (\\Exception $e) { return $e->getMessage(); }")
        .await
        .unwrap();
    assert_eq!(v, Value::Str("boom".to_string()));

    // Uncaught, it surfaces back to the host as an interpreter error.
    let err = php.eval("RustWorld::fail();").await.unwrap_err();
    match err {
        Error::Interpreter(e) => assert_eq!(e.message, "boom"),
        other => panic!("unexpected error {:?}", other),
    }
    php.terminate().await;
}

#[tokio::test]
#[ignore = "requires a php binary on PATH"]
async fn test_frame_cleanup() {
    let mut php = PhpWorld::new(php_settings());
    php.push_frame();
    let mut held = Vec::new();
    for _ in 0..10 {
        held.push(php.class("ArrayObject").construct(&[]).await.unwrap());
    }
    php.pop_frame().await.unwrap();
    assert_eq!(php.n_objects().await.unwrap(), 0);
    php.terminate().await;
}

#[tokio::test]
#[ignore = "requires a php binary on PATH"]
async fn test_stdout_split() {
    let mut php = PhpWorld::new(Settings {
        stdout: StdoutMode::Piped,
        ..php_settings()
    });
    php.echo(&["HELLO".into()]).await.unwrap();
    let reader = php.get_stdout_reader().await.unwrap();
    assert_eq!(reader.read_to_string().await.unwrap(), "HELLO");

    php.echo(&["WORLD".into()]).await.unwrap();
    let reader = php.get_stdout_reader().await.unwrap();
    assert_eq!(reader.read_to_string().await.unwrap(), "WORLD");
    php.terminate().await;
}

#[tokio::test]
#[ignore = "requires a php binary on PATH"]
async fn test_iteration() {
    let mut php = PhpWorld::new(php_settings());
    php.var("list")
        .set(serde_json::json!({"a": 1, "b": 2}))
        .await
        .unwrap();
    let mut entries = Vec::new();
    let mut iter = php.var("list").iterate().await.unwrap();
    while let Some((key, value)) = iter.next().await.unwrap() {
        entries.push((key, value));
    }
    assert_eq!(
        entries,
        vec![
            (Value::Str("a".into()), Value::Int(1)),
            (Value::Str("b".into()), Value::Int(2)),
        ]
    );
    php.terminate().await;
}

#[tokio::test]
#[ignore = "requires a php binary on PATH"]
async fn test_terminate_and_respawn() {
    let mut php = PhpWorld::new(php_settings());
    assert_eq!(php.constant("PHP_INT_SIZE").await.unwrap(), Value::Int(8));
    assert_eq!(php.terminate().await, 0);
    // The next operation respawns a fresh interpreter.
    assert_eq!(php.constant("PHP_INT_SIZE").await.unwrap(), Value::Int(8));
    php.terminate().await;
}

#[tokio::test]
#[ignore = "requires a php binary on PATH"]
async fn test_exit_code() {
    let mut php = PhpWorld::new(php_settings());
    let code = php.exit(7).await.unwrap();
    assert_eq!(code, 7);
    // Auto-respawn after the exit.
    assert_eq!(php.constant("PHP_INT_SIZE").await.unwrap(), Value::Int(8));
    php.terminate().await;
}

#[tokio::test]
#[ignore = "requires a php binary on PATH"]
async fn test_unix_socket_control_channel() {
    let dir = std::env::temp_dir().join(format!("php_world_test_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let sock = dir.join("ctl.sock");
    let mut php = PhpWorld::new(Settings {
        unix_socket_name: sock.to_str().unwrap().to_string(),
        ..php_settings()
    });
    assert_eq!(php.constant("PHP_INT_SIZE").await.unwrap(), Value::Int(8));
    php.terminate().await;
    assert!(!sock.exists(), "socket file removed on terminate");
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
#[ignore = "requires a php binary on PATH"]
async fn test_init_php_file() {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("php_world_init_{}.php", std::process::id()));
    std::fs::write(&path, "<?php $preloaded = 'ready';\n").unwrap();
    let mut php = PhpWorld::new(Settings {
        init_php_file: path.to_str().unwrap().to_string(),
        ..php_settings()
    });
    let v = php.var("preloaded").get().await.unwrap();
    assert_eq!(v, Value::Str("ready".to_string()));
    php.terminate().await;
    let _ = std::fs::remove_file(&path);
}
