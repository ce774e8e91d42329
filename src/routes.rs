use actix_web::{web, HttpResponse};

use crate::auth::{self, RequireAuth};
use crate::envelope::Envelope;
use crate::error::{json_config, path_config, query_config};
use crate::handlers::{admin, orders, products};
use crate::store::Db;

async fn health(db: web::Data<Db>) -> HttpResponse {
    HttpResponse::Ok().json(Envelope::ok(serde_json::json!({ "backend": db.backend() })).with_message("OK"))
}

/// Mounts the whole `/api` tree. Expects `web::Data<Db>` and
/// `web::Data<auth::Auth>` to be registered on the app.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .app_data(query_config())
        .app_data(path_config())
        .service(
            web::scope("/api")
                .route("/health", web::get().to(health))
                .service(
                    web::scope("/auth")
                        .route("/register", web::post().to(auth::register))
                        .route("/login", web::post().to(auth::login))
                        .route("/refresh", web::post().to(auth::refresh_token)),
                )
                .service(
                    web::scope("/products")
                        .wrap(RequireAuth::admin_writes())
                        .route("", web::get().to(products::list_products))
                        .route("", web::post().to(products::create_product))
                        .route("/{id}", web::get().to(products::get_product))
                        .route("/{id}", web::put().to(products::update_product))
                        .route("/{id}", web::delete().to(products::delete_product)),
                )
                .service(
                    web::scope("/orders")
                        .wrap(RequireAuth::user())
                        .route("", web::post().to(orders::place_order)),
                )
                .service(
                    web::scope("/admin")
                        .wrap(RequireAuth::admin())
                        .route("/dashboard", web::get().to(admin::get_dashboard))
                        .route("/products", web::get().to(admin::list_products))
                        .route("/orders", web::get().to(admin::list_orders))
                        .route("/orders/{id}/status", web::put().to(admin::update_order_status))
                        .route("/users", web::get().to(admin::list_users))
                        .route("/users/{id}/role", web::put().to(admin::update_user_role)),
                ),
        );
}

#[cfg(test)]
mod tests {
    use actix_web::http::{header, StatusCode};
    use actix_web::{test, App};
    use serde_json::{json, Value};

    use super::*;
    use crate::auth::Auth;
    use crate::models::{Category, Role};
    use crate::services::{products as product_service, users};
    use crate::testing::{memory_db, product_request};

    struct Harness {
        db: Db,
        auth: web::Data<Auth>,
        admin_token: String,
        user_token: String,
        admin_id: i64,
    }

    async fn harness() -> Harness {
        let db = memory_db().await;
        let auth = web::Data::new(Auth::new("routes-test", 4));
        let admin = users::create(&db, "Admin", "admin@example.com", "x".into(), Role::Admin)
            .await
            .unwrap();
        let user = users::create(&db, "Kioko Musyoka", "kioko@example.com", "x".into(), Role::User)
            .await
            .unwrap();
        let (admin_token, _) = auth.generate_tokens(&admin).unwrap();
        let (user_token, _) = auth.generate_tokens(&user).unwrap();
        Harness {
            db,
            auth,
            admin_token,
            user_token,
            admin_id: admin.id,
        }
    }

    macro_rules! app {
        ($h:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($h.db.clone()))
                    .app_data($h.auth.clone())
                    .configure(configure),
            )
            .await
        };
    }

    fn bearer(token: &str) -> (header::HeaderName, String) {
        (header::AUTHORIZATION, format!("Bearer {token}"))
    }

    #[actix_web::test]
    async fn public_listing_uses_envelope_and_pagination() {
        let h = harness().await;
        for i in 0..3 {
            product_service::create(&h.db, product_request(&format!("Phone {i}"), Category::Phones, 10_000.0))
                .await
                .unwrap();
        }
        let app = app!(h);

        let req = test::TestRequest::get()
            .uri("/api/products?limit=2&category=phones")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["products"].as_array().unwrap().len(), 2);
        assert_eq!(
            body["data"]["pagination"],
            json!({"currentPage": 1, "totalPages": 2, "totalProducts": 3})
        );

        let req = test::TestRequest::get()
            .uri("/api/products?category=tablets")
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["success"], false);

        let req = test::TestRequest::get().uri("/api/products?limit=500").to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["errors"][0]["field"], "limit");
    }

    #[actix_web::test]
    async fn product_writes_require_admin() {
        let h = harness().await;
        let app = app!(h);
        let product = json!({
            "name": "Galaxy S24", "description": "Flagship phone", "price": 120000,
            "category": "phones", "stock": 4,
            "images": [{"url": "/img/s24.jpg", "isPrimary": true}]
        });

        let req = test::TestRequest::post().uri("/api/products").set_json(&product).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::post()
            .uri("/api/products")
            .insert_header(bearer(&h.user_token))
            .set_json(&product)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

        let req = test::TestRequest::post()
            .uri("/api/products")
            .insert_header(bearer(&h.admin_token))
            .set_json(&product)
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let body: Value = test::read_body_json(res).await;
        let id = body["data"]["product"]["id"].as_i64().unwrap();
        assert_eq!(body["data"]["product"]["images"][0]["isPrimary"], true);

        let req = test::TestRequest::put()
            .uri(&format!("/api/products/{id}"))
            .insert_header(bearer(&h.admin_token))
            .set_json(json!({"price": 110000, "isFeatured": true}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["product"]["price"], 110000.0);
        assert_eq!(body["data"]["product"]["isFeatured"], true);

        let req = test::TestRequest::delete()
            .uri(&format!("/api/products/{id}"))
            .insert_header(bearer(&h.admin_token))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!({"success": true, "message": "Product deleted successfully"}));

        let req = test::TestRequest::get().uri(&format!("/api/products/{id}")).to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body, json!({"success": false, "message": "Product not found"}));
    }

    #[actix_web::test]
    async fn invalid_bodies_and_ids_use_the_envelope() {
        let h = harness().await;
        let app = app!(h);

        let req = test::TestRequest::post()
            .uri("/api/products")
            .insert_header(bearer(&h.admin_token))
            .set_json(json!({"name": "", "description": "x", "price": -1, "category": "phones"}))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(res).await;
        let fields: Vec<_> = body["errors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["field"].as_str().unwrap())
            .collect();
        assert_eq!(fields, ["name", "price"]);

        let req = test::TestRequest::post()
            .uri("/api/products")
            .insert_header(bearer(&h.admin_token))
            .insert_header((header::CONTENT_TYPE, "application/json"))
            .set_payload("{not json")
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["success"], false);

        let req = test::TestRequest::get().uri("/api/products/abc").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn checkout_and_admin_order_flow() {
        let h = harness().await;
        let mut request = product_request("Sony WH-1000XM5", Category::Audio, 45_000.0);
        request.stock = 2;
        let headphones = product_service::create(&h.db, request).await.unwrap();
        let app = app!(h);

        let order = json!({
            "items": [{"productId": headphones.id, "quantity": 1}],
            "shippingAddress": {
                "fullName": "Kioko Musyoka", "phone": "0722000111", "street": "Moi Ave",
                "city": "Mombasa", "country": "Kenya"
            },
            "paymentMethod": "mpesa"
        });
        let req = test::TestRequest::post()
            .uri("/api/orders")
            .insert_header(bearer(&h.user_token))
            .set_json(&order)
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let body: Value = test::read_body_json(res).await;
        let placed = &body["data"]["order"];
        assert_eq!(placed["shippingCost"], 0.0);
        assert_eq!(placed["tax"], 7_200.0);
        assert_eq!(placed["total"], 52_200.0);
        let id = placed["id"].as_i64().unwrap();

        let req = test::TestRequest::get()
            .uri("/api/admin/orders?search=kioko")
            .insert_header(bearer(&h.admin_token))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["pagination"]["totalOrders"], 1);
        let listed = &body["data"]["orders"][0];
        assert_eq!(listed["user"]["email"], "kioko@example.com");
        assert!(listed["user"].get("password").is_none());

        let req = test::TestRequest::put()
            .uri(&format!("/api/admin/orders/{id}/status"))
            .insert_header(bearer(&h.admin_token))
            .set_json(json!({"status": "delivered", "paymentStatus": "paid"}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["order"]["orderStatus"], "delivered");
        assert!(body["data"]["order"]["deliveredAt"].is_string());

        let req = test::TestRequest::put()
            .uri(&format!("/api/admin/orders/{id}/status"))
            .insert_header(bearer(&h.admin_token))
            .set_json(json!({"status": "shipped"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get()
            .uri("/api/admin/dashboard")
            .insert_header(bearer(&h.admin_token))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["stats"]["totalOrders"], 1);
        assert_eq!(body["data"]["stats"]["totalRevenue"], 52_200.0);
        assert_eq!(body["data"]["recentOrders"][0]["user"]["name"], "Kioko Musyoka");
    }

    #[actix_web::test]
    async fn admin_user_management() {
        let h = harness().await;
        let app = app!(h);

        let req = test::TestRequest::get()
            .uri("/api/admin/users?role=user")
            .insert_header(bearer(&h.admin_token))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["pagination"]["totalUsers"], 1);
        let user_id = body["data"]["users"][0]["id"].as_i64().unwrap();

        let req = test::TestRequest::put()
            .uri(&format!("/api/admin/users/{}/role", h.admin_id))
            .insert_header(bearer(&h.admin_token))
            .set_json(json!({"role": "user"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::put()
            .uri(&format!("/api/admin/users/{user_id}/role"))
            .insert_header(bearer(&h.admin_token))
            .set_json(json!({"role": "admin"}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["user"]["role"], "admin");

        // The promotion applies to the token issued before it.
        let req = test::TestRequest::get()
            .uri("/api/admin/users")
            .insert_header(bearer(&h.user_token))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
    }
}
