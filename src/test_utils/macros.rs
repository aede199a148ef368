/// Asserts the next stream item within a timeout.
///
/// `assert_next!(stream, expected)` unwraps an `Ok` item and compares it;
/// `assert_next!(stream, Err(expected))` compares an error item. Both accept
/// a trailing `timeout = secs` (default 5).
#[macro_export]
macro_rules! assert_next {
    ($stream: expr, Err($expected_err:expr)) => {
        $crate::assert_next!($stream, Err($expected_err), timeout = 5)
    };
    ($stream: expr, Err($expected_err:expr), timeout = $secs: expr) => {
        let message = tokio::time::timeout(
            std::time::Duration::from_secs($secs),
            tokio_stream::StreamExt::next(&mut $stream),
        )
        .await
        .expect("timed out");
        if let Some(msg) = message {
            let expected = &$expected_err;
            assert_eq!(&msg, &Err(expected.clone()), "Expected error {expected:?}, got {msg:?}");
        } else {
            panic!("Expected error {:?}, but channel was closed", $expected_err);
        }
    };

    ($stream: expr, $expected: expr) => {
        $crate::assert_next!($stream, $expected, timeout = 5)
    };
    ($stream: expr, $expected: expr, timeout = $secs: expr) => {
        let message = tokio::time::timeout(
            std::time::Duration::from_secs($secs),
            tokio_stream::StreamExt::next(&mut $stream),
        )
        .await
        .expect("timed out");
        let expected = $expected;
        match message {
            std::option::Option::Some(std::result::Result::Ok(msg)) => {
                assert_eq!(msg, expected, "Expected {expected:?}, got {msg:?}");
            }
            std::option::Option::Some(std::result::Result::Err(e)) => {
                panic!("Expected Ok({expected:?}), got Err({e:?})");
            }
            std::option::Option::None => {
                panic!("Expected Ok({expected:?}), but channel was closed");
            }
        }
    };
}

/// Asserts the stream yields no further items and is closed.
#[macro_export]
macro_rules! assert_closed {
    ($stream: expr) => {
        $crate::assert_closed!($stream, timeout = 5)
    };
    ($stream: expr, timeout = $secs: expr) => {
        let message = tokio::time::timeout(
            std::time::Duration::from_secs($secs),
            tokio_stream::StreamExt::next(&mut $stream),
        )
        .await
        .expect("timed out");
        assert!(message.is_none(), "Expected closed stream, got {message:?}");
    };
}
