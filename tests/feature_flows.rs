//! Feature flows: per-feature postback snapshots, prerequisites and callbacks.

mod helpers;

use chrono::NaiveDate;
use ctms::ctms::events::{Event, EventKind};
use ctms::ctms::models::exams::ExamFilter;
use ctms::ctms::models::grades::Classification;
use ctms::ctms::models::subscription::{SubscriptionAction, SubscriptionCommand};
use ctms::ctms::{CtmsError, ErrorKind, Feature};
use ctms::data::kv::KV_SESSION;
use helpers::{ScriptedTransport, bare_page, client, form_value, page};
use std::sync::{Arc, Mutex};

const SCHEDULE_CONTENT: &str = r#"
    <input id="LeftCol_Lichhoc1_txtNgaydautuan" value="2021-07-12" />
    <table><tr><td>Thứ 2</td><td>
        <table id="LeftCol_Lichhoc1_rptrLichhoc_grvLichhoc_0">
            <tr><th>#</th><th>Giờ</th><th>Phòng</th><th>Môn</th><th>GV</th><th>Lớp</th><th>TT</th></tr>
            <tr><td>1</td><td>07:00</td><td>P.301</td><td>Toán rời rạc</td><td>Trần B</td><td>TRR01</td>
                <td><span><a href="javascript:getNote(42);"><img title="Đã có ghi chú" /></a></span></td></tr>
        </table>
    </td></tr></table>"#;

const EXAMS_CONTENT: &str = r#"<div id="leftcontent"><table>
    <tr><th>STT</th><th>Giờ</th><th>Phòng</th><th>Môn</th><th>DS</th></tr>
    <tr><td>1</td><td>07:30 05/01/2022</td><td>P.201</td><td>Giải tích</td><td>DS01</td></tr>
</table></div>"#;

const SUBSCRIPTION_BOOTSTRAP: &str =
    r#"<script>function list() { call("getmodule:" + 20210077; }</script>"#;

fn subscription_reply(action: &str) -> String {
    let header = "<tr><th>TT</th><th>Mã</th><th>Lớp</th><th>Min</th><th>Max</th><th>ĐK</th><th>Thời gian</th><th>Lịch</th></tr>";
    format!(
        r#"1234|<table border="1">{header}
            <tr><td>{action}</td><td>CNPM.01</td><td>Công nghệ phần mềm (3 tc) Nguyễn Văn A</td>
            <td>20 sv</td><td>60 sv</td><td>42 sv</td><td>07:00 01/08/21</td><td></td></tr>
        </table><table border="1">{header}</table>"#
    )
}

#[tokio::test]
async fn test_schedule_keeps_its_own_context_across_other_features() {
    let transport = ScriptedTransport::new();
    let (api, _) = client(&transport).await;

    transport.push_page(page("sched", SCHEDULE_CONTENT));
    let week = api.schedule(None).await.unwrap();
    assert_eq!(week.days.len(), 1);
    assert_eq!(week.days[0].rows[0].note_id, Some(42));

    // Exams prefetch and post move the global context on.
    transport.push_page(page("exam-get", EXAMS_CONTENT));
    transport.push_page(page("exam-post", EXAMS_CONTENT));
    let exams = api.exams(ExamFilter::Coming).await.unwrap();
    assert_eq!(exams.len(), 1);
    assert_eq!(
        form_value(&transport.last_request(), "ctl00$LeftCol$Lichthi1$Tuychon"),
        Some("rbtnChuathi")
    );
    assert_eq!(
        api.session().global().view_state.as_deref(),
        Some("vs-exam-post")
    );

    transport.push_page(page("sched-2", SCHEDULE_CONTENT));
    api.schedule(NaiveDate::from_ymd_opt(2021, 7, 5))
        .await
        .unwrap();

    let post = transport.last_request();
    assert_eq!(post.path, "/Lichhoc.aspx");
    assert_eq!(form_value(&post, "__VIEWSTATE"), Some("vs-sched"));
    assert_eq!(form_value(&post, "__EVENTVALIDATION"), Some("ev-sched"));
    assert_eq!(
        form_value(&post, "ctl00$LeftCol$Lichhoc1$txtNgaydautuan"),
        Some("2021-07-05")
    );
    assert_eq!(
        form_value(&post, "ctl00$LeftCol$Lichhoc1$btnXemlich"),
        Some("Xem lịch")
    );

    // The schedule snapshot now reflects the latest schedule page.
    assert_eq!(
        api.session()
            .restore(Feature::Schedule)
            .and_then(|c| c.view_state),
        Some("vs-sched-2".to_owned())
    );
}

#[tokio::test]
async fn test_exams_prefetch_only_once() {
    let transport = ScriptedTransport::new();
    let (api, _) = client(&transport).await;

    transport.push_page(page("e1", EXAMS_CONTENT));
    transport.push_page(page("e2", EXAMS_CONTENT));
    transport.push_page(page("e3", EXAMS_CONTENT));

    api.exams(ExamFilter::All).await.unwrap();
    api.exams(ExamFilter::Ended).await.unwrap();

    let sent = transport.requests();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].method, http::Method::GET);
    assert_eq!(form_value(&sent[1], "__VIEWSTATE"), Some("vs-e1"));
    assert_eq!(form_value(&sent[2], "__VIEWSTATE"), Some("vs-e2"));
    assert_eq!(
        form_value(&sent[2], "ctl00$LeftCol$Lichthi1$btnHien"),
        Some("   Hiện   ")
    );
}

#[tokio::test]
async fn test_note_requires_a_schedule_fetch() {
    let transport = ScriptedTransport::new();
    let (api, _) = client(&transport).await;

    let err = api.note(42).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FeaturePrecondition);
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn test_note_uses_schedule_context_and_week() {
    let transport = ScriptedTransport::new();
    let (api, _) = client(&transport).await;

    transport.push_page(page("sched", SCHEDULE_CONTENT));
    api.schedule(None).await.unwrap();

    let seen = Arc::new(Mutex::new(None));
    let s = seen.clone();
    api.events().subscribe(EventKind::Note, move |event| {
        if let Event::Note(note) = event {
            *s.lock().unwrap() = Some(note.content.clone());
        }
        Ok(())
    });

    transport.push_page("4|abcdMang theo máy tính");
    let note = api.note(42).await.unwrap();
    assert_eq!(note.content, "Mang theo máy tính");
    assert_eq!(*seen.lock().unwrap(), Some("Mang theo máy tính".to_owned()));

    let post = transport.last_request();
    assert_eq!(form_value(&post, "__CALLBACKID"), Some("ctl00$LeftCol$Lichhoc1"));
    assert_eq!(form_value(&post, "__CALLBACKPARAM"), Some("get-note$42"));
    assert_eq!(
        form_value(&post, "ctl00$LeftCol$Lichhoc1$txtNgaydautuan"),
        Some("2021-07-12")
    );
    assert_eq!(form_value(&post, "__VIEWSTATE"), Some("vs-sched"));
}

#[tokio::test]
async fn test_subscription_bootstraps_once_and_sends_commands() {
    let transport = ScriptedTransport::new();
    let (api, _) = client(&transport).await;

    transport.push_page(page("subs", SUBSCRIPTION_BOOTSTRAP));
    transport.push_page(subscription_reply(
        r#"<a href="javascript:subcrible(1201, 3, 77)">Đăng ký</a>"#,
    ));
    let listing = api.subscribe(SubscriptionCommand::List).await.unwrap();
    assert_eq!(
        listing.waiting[0].action,
        Some(SubscriptionAction::Subscribe { class_id: 1201 })
    );
    assert!(listing.subscribed.is_empty());

    let sent = transport.requests();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].path, "/DangkyLoptinchi.aspx");
    assert_eq!(form_value(&sent[1], "__CALLBACKID"), Some("__Page"));
    assert_eq!(form_value(&sent[1], "__CALLBACKPARAM"), Some("getmodule:20210077"));
    assert_eq!(form_value(&sent[1], "__VIEWSTATE"), Some("vs-subs"));

    transport.push_page(subscription_reply(
        r#"<a href="javascript:unSubcrible(1350,77)">Hủy</a>"#,
    ));
    let updated = api
        .subscribe(SubscriptionCommand::Unsubscribe(1350))
        .await
        .unwrap();
    assert_eq!(
        updated.waiting[0].action,
        Some(SubscriptionAction::Unsubscribe { class_id: 1350 })
    );

    let post = transport.last_request();
    assert_eq!(transport.requests().len(), 3);
    assert_eq!(
        form_value(&post, "__CALLBACKID"),
        Some("ctl00$LeftCol$LoptinchiDangky1")
    );
    assert_eq!(
        form_value(&post, "__CALLBACKPARAM"),
        Some("unsubcrible:1350:20210077")
    );
}

#[tokio::test]
async fn test_subscription_without_student_id_fails() {
    let transport = ScriptedTransport::new();
    let (api, _) = client(&transport).await;

    transport.push_page(page("subs", "<p>Hết thời gian đăng ký</p>"));
    let err = api.subscribe(SubscriptionCommand::List).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FeaturePrecondition);
    assert_eq!(api.session().student_id(), None);
}

#[tokio::test]
async fn test_rejected_subscription_surfaces_portal_message() {
    let transport = ScriptedTransport::new();
    let (api, _) = client(&transport).await;

    transport.push_page(page("subs", SUBSCRIPTION_BOOTSTRAP));
    transport.push_page("27|Lỗi: Lớp đã hết chỉ tiêu");

    let err = api
        .subscribe(SubscriptionCommand::Subscribe(1201))
        .await
        .unwrap_err();
    match err {
        CtmsError::SubmissionRejected(message) => {
            assert!(message.contains("subcrible:1201:20210077"));
            assert!(message.contains("Lỗi: Lớp đã hết chỉ tiêu"));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_logout_requires_home_page_tokens() {
    let transport = ScriptedTransport::new();
    let (api, _) = client(&transport).await;

    let err = api.logout().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FeaturePrecondition);
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn test_logout_posts_callback_and_resets_state() {
    let transport = ScriptedTransport::new();
    let (api, store) = client(&transport).await;

    transport.push_page_with_session(page("home", ""), "sess");
    api.home().await.unwrap();
    transport.push_page(page("sched", SCHEDULE_CONTENT));
    api.schedule(None).await.unwrap();

    transport.push_page(page("bye", ""));
    api.logout().await.unwrap();

    let post = transport.last_request();
    assert_eq!(post.path, "");
    assert_eq!(form_value(&post, "__CALLBACKID"), Some("ctl00$QuanlyMenu1"));
    assert_eq!(form_value(&post, "__CALLBACKPARAM"), Some("logout"));
    assert_eq!(form_value(&post, "__VIEWSTATE"), Some("vs-home"));
    assert_eq!(post.session_token.as_deref(), Some("sess"));

    assert_eq!(api.session().token(), None);
    assert_eq!(store.get(KV_SESSION).await.as_deref(), Some(""));
    assert!(api.session().global().is_empty());
    assert!(api.session().restore(Feature::Schedule).is_none());
    assert!(api.session().restore(Feature::Logout).is_none());
}

#[tokio::test]
async fn test_login_hashes_password_and_reports_rejection() {
    let transport = ScriptedTransport::new();
    let (api, _) = client(&transport).await;

    // Home page prefetch, then a login page that still shows the panel.
    transport.push_page(page("home", r#"<div id="LeftCol_UserLogin1_pnlLogin"></div>"#));
    transport.push_page(page(
        "login",
        r#"<div id="LeftCol_UserLogin1_pnlLogin">
            <span id="LeftCol_UserLogin1_lblMess">Sai tên đăng nhập hoặc mật khẩu</span>
        </div>"#,
    ));

    let err = api.login("sv001", "password").await.unwrap_err();
    assert!(matches!(
        err,
        CtmsError::SubmissionRejected(ref m) if m == "Sai tên đăng nhập hoặc mật khẩu"
    ));

    let sent = transport.requests();
    assert_eq!(sent.len(), 2);
    let post = &sent[1];
    assert_eq!(post.path, "/login.aspx");
    assert_eq!(
        form_value(post, "ctl00$LeftCol$UserLogin1$txtPassword"),
        Some("5f4dcc3b5aa765d61d8327deb882cf99")
    );
    assert_eq!(form_value(post, "ctl00$LeftCol$UserLogin1$btnLogin"), Some("Đăng nhập"));
    assert_eq!(form_value(post, "__VIEWSTATE"), Some("vs-home"));
    assert!(!api.is_logged_in());
}

#[tokio::test]
async fn test_login_success_publishes_login_event() {
    let transport = ScriptedTransport::new();
    let (api, _) = client(&transport).await;

    let logins = Arc::new(Mutex::new(0));
    let l = logins.clone();
    api.events().subscribe(EventKind::Login, move |_| {
        *l.lock().unwrap() += 1;
        Ok(())
    });

    transport.push_page(page("home", ""));
    transport.push_page_with_session(page("user", "<p>Xin chào</p>"), "signed-in");
    api.login("sv001", "secret").await.unwrap();

    assert!(api.is_logged_in());
    assert_eq!(*logins.lock().unwrap(), 1);
    assert_eq!(api.session().token().as_deref(), Some("signed-in"));
}

#[tokio::test]
async fn test_results_are_graded_and_published() {
    let transport = ScriptedTransport::new();
    let (api, _) = client(&transport).await;

    let classification = Arc::new(Mutex::new(None));
    let c = classification.clone();
    api.events().subscribe_named("results", move |event| {
        if let Event::Results(report) = event {
            *c.lock().unwrap() = Some(report.classification);
        }
        Ok(())
    })
    .unwrap();

    transport.push_page(bare_page(
        r#"<div id="leftcontent">
        <table class="RowEffect CenterElement">
            <tr><th>Môn</th><th>TC</th><th>Lớp</th><th>GV</th><th>CC</th><th>ĐK</th><th>HK</th></tr>
            <tr><td>Triết học</td><td>3</td><td>TH01</td><td>Lê D</td><td>8</td><td>7</td><td>9</td></tr>
            <tr><td>Tin học</td><td>2</td><td>TI01</td><td>Lê E</td><td>9</td><td>?</td><td>9</td></tr>
        </table></div>"#,
    ));

    let report = api.results().await.unwrap();
    assert_eq!(report.results.len(), 2);
    assert_eq!(report.results[0].grade.map(|g| g.letter), Some("A"));
    assert_eq!(report.results[1].average, None);
    assert_eq!(report.cumulative, 4.0);
    assert_eq!(
        *classification.lock().unwrap(),
        Some(Classification::Excellent)
    );
}
