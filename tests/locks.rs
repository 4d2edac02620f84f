// tests/locks.rs
//
// LockService: shared/exclusive database lock с приоритетом писателя и таймаутами.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use FolioDB::{FolioError, LockService, LockState};

#[tokio::test]
async fn waiting_writer_blocks_new_readers() -> Result<()> {
    let locks = Arc::new(LockService::new(Duration::from_millis(300)));
    let reader = locks.enter_transaction().await?;

    let writer = {
        let locks = locks.clone();
        tokio::spawn(async move {
            let ex = locks.enter_exclusive().await?;
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(ex);
            anyhow::Ok(())
        })
    };
    // let the writer register itself as waiting
    tokio::time::sleep(Duration::from_millis(30)).await;

    let short = tokio::time::timeout(Duration::from_millis(50), locks.enter_transaction()).await;
    assert!(short.is_err(), "new reader must queue behind the waiting writer");
    assert!(locks.try_enter_exclusive().is_none());

    drop(reader);
    writer.await??;
    assert_eq!(locks.state(), LockState::Closed);

    let again = locks.enter_transaction().await?;
    assert_eq!(locks.state(), LockState::Shared(1));
    drop(again);
    Ok(())
}

#[tokio::test]
async fn reader_times_out_behind_exclusive() -> Result<()> {
    let locks = LockService::new(Duration::from_millis(40));
    let ex = locks.enter_exclusive().await?;
    let err = locks.enter_transaction().await.err().expect("timeout");
    assert!(FolioError::is_lock_timeout(&err));
    match err.downcast_ref::<FolioError>() {
        Some(FolioError::LockTimeout { timeout, .. }) => {
            assert_eq!(*timeout, Duration::from_millis(40))
        }
        other => panic!("unexpected error: {:?}", other),
    }
    drop(ex);
    let _r = locks.enter_transaction().await?;
    Ok(())
}
