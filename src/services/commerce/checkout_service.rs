use crate::{
    config::AppConfig,
    db::DbPool,
    entities::{
        order::{self, OrderStatus},
        payment_attempt::PaymentAttemptStatus,
    },
    errors::{CheckoutErrorCode, ServiceError},
    events::{Event, EventSender},
    repositories::order_repository::{
        MarkPaidOutcome, NewOrderItem, OrderDetails, OrderDraft, OrderRepository,
        RandomOrderNumberGenerator,
    },
    services::{
        commerce::{
            address_service::{AddressService, ShippingAddress},
            coupon_service::{normalize_code, CouponService},
            pricing_service::{CartLine, PricingCalculator},
            shipping_service::{ShippingMethod, ShippingService},
        },
        payments::{
            CallbackStatus, PaymentGateway, ProviderError, SessionRequest, VerificationOutcome,
            VerifyRequest,
        },
    },
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Checkout input as submitted by the storefront.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlaceOrderRequest {
    #[serde(default)]
    pub items: Vec<CartLine>,
    #[serde(default)]
    pub shipping_method_id: String,
    #[serde(default)]
    pub shipping_address: Option<ShippingAddress>,
    #[serde(default)]
    pub saved_address_id: Option<Uuid>,
    #[serde(default)]
    pub coupon_code: Option<String>,
    /// Total the client displayed; rejected with `PRICING_MISMATCH` when it differs
    #[serde(default)]
    pub expected_total: Option<i64>,
}

/// A persisted order plus the hosted payment page to send the shopper to.
#[derive(Debug, Clone, Serialize)]
pub struct PlacedOrder {
    pub order: OrderDetails,
    pub redirect_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentRedirect {
    pub order_number: String,
    pub redirect_url: String,
}

/// Final state of an order after a provider callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettledPayment {
    pub order_id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub payment_reference: Option<String>,
}

impl From<&order::Model> for SettledPayment {
    fn from(order: &order::Model) -> Self {
        Self {
            order_id: order.id,
            order_number: order.order_number.clone(),
            status: order.status,
            payment_reference: order.payment_reference.clone(),
        }
    }
}

/// Knobs the orchestrator reads from configuration.
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub currency: String,
    pub callback_url: String,
    pub gateway_timeout: Duration,
}

impl CheckoutSettings {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            currency: config.currency.clone(),
            callback_url: config.payment_callback_url.clone(),
            gateway_timeout: config.payment_request_timeout(),
        }
    }
}

fn already_finalized(order: &order::Model) -> ServiceError {
    ServiceError::checkout(
        CheckoutErrorCode::OrderAlreadyFinalized,
        format!("Order is already {}", order.status),
    )
    .for_order(&order.order_number)
}

fn unknown_session() -> ServiceError {
    ServiceError::checkout(
        CheckoutErrorCode::OrderNotFound,
        "No order matches this payment session",
    )
}

/// Structural checks on the submitted cart; pricing happens later.
fn validate_cart(items: &[CartLine]) -> Result<(), ServiceError> {
    if items.is_empty() {
        return Err(ServiceError::invalid_field(
            CheckoutErrorCode::EmptyCart,
            "items",
            "The cart is empty",
        ));
    }

    for (index, line) in items.iter().enumerate() {
        let problem = if line.quantity < 1 {
            Some(("quantity", "quantity must be at least 1"))
        } else if line.unit_price < 0 {
            Some(("unit_price", "unit price must not be negative"))
        } else if line.sku.trim().is_empty() {
            Some(("sku", "sku is required"))
        } else if line.name.trim().is_empty() {
            Some(("name", "name is required"))
        } else {
            None
        };

        if let Some((field, message)) = problem {
            return Err(ServiceError::invalid_field(
                CheckoutErrorCode::InvalidCartLine,
                format!("items[{}].{}", index, field),
                message,
            ));
        }
    }
    Ok(())
}

/// Drives an order from a validated cart to a settled payment.
///
/// Only this service moves orders between statuses; it talks to the provider
/// exclusively through [`PaymentGateway`].
#[derive(Clone)]
pub struct CheckoutService {
    orders: OrderRepository,
    coupons: CouponService,
    addresses: AddressService,
    shipping: ShippingService,
    pricing: PricingCalculator,
    gateway: Arc<dyn PaymentGateway>,
    event_sender: Arc<EventSender>,
    settings: CheckoutSettings,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DbPool>,
        config: &AppConfig,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        let numbers = Arc::new(RandomOrderNumberGenerator::new(
            config.order_number_prefix.clone(),
        ));
        Self {
            orders: OrderRepository::new(db.clone(), numbers, config.order_number_max_attempts),
            coupons: CouponService::new(db.clone()),
            addresses: AddressService::new(db),
            shipping: ShippingService::new(&config.shipping_methods),
            pricing: PricingCalculator::new(config.tax_rate_bps),
            gateway,
            event_sender,
            settings: CheckoutSettings::from_app_config(config),
        }
    }

    pub fn addresses(&self) -> &AddressService {
        &self.addresses
    }

    pub fn shipping_methods(&self) -> &[ShippingMethod] {
        self.shipping.list()
    }

    pub fn provider_name(&self) -> &'static str {
        self.gateway.provider_name()
    }

    /// Validates, prices and persists the cart, then opens a payment session.
    ///
    /// The order is committed before the provider is contacted. If the session
    /// request fails the order stays `PENDING_PAYMENT` and the error carries its
    /// number so the caller can offer retry-payment.
    #[instrument(skip(self, request), fields(owner_id = %owner_id))]
    pub async fn place_order(
        &self,
        owner_id: Uuid,
        request: PlaceOrderRequest,
    ) -> Result<PlacedOrder, ServiceError> {
        validate_cart(&request.items)?;
        let shipping = self.shipping.resolve(&request.shipping_method_id)?.clone();
        let address = self
            .addresses
            .resolve(owner_id, request.shipping_address, request.saved_address_id)
            .await?;

        let subtotal = self.pricing.subtotal(&request.items)?;
        let coupon_code = request
            .coupon_code
            .as_deref()
            .map(normalize_code)
            .filter(|code| !code.is_empty());
        let coupon = match coupon_code.as_deref() {
            Some(code) => Some(self.coupons.validate(code, subtotal, &request.items).await?),
            None => None,
        };

        let price = self.pricing.price(
            &request.items,
            shipping.cost,
            coupon.as_ref().map_or(0, |c| c.discount_amount),
        )?;

        if let Some(expected) = request.expected_total {
            if expected != price.total_amount {
                warn!(expected, computed = price.total_amount, "client total disagrees with server pricing");
                return Err(ServiceError::invalid_field(
                    CheckoutErrorCode::PricingMismatch,
                    "expected_total",
                    format!(
                        "Order total changed to {}, please review your cart",
                        price.total_amount
                    ),
                ));
            }
        }

        let items = request
            .items
            .iter()
            .map(NewOrderItem::from_cart_line)
            .collect::<Result<Vec<_>, _>>()?;

        let details = self
            .orders
            .create(OrderDraft {
                owner_id,
                currency: self.settings.currency.clone(),
                price,
                shipping_method_id: shipping.id.clone(),
                shipping_method_name: shipping.name.clone(),
                shipping_address: address,
                coupon_code: coupon.map(|c| c.code),
                items,
            })
            .await?;

        let order = &details.order;
        counter!("checkout.orders.created", 1);
        info!(order_id = %order.id, order_number = %order.order_number, total = order.total_amount, "order placed");
        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id: order.id,
                order_number: order.order_number.clone(),
                total_amount: order.total_amount,
            })
            .await;

        let redirect = self.request_session(order).await?;

        let refreshed = match self.orders.find_by_id(order.id).await? {
            Some(current) => self.orders.load_details(current).await?,
            None => details,
        };

        Ok(PlacedOrder {
            order: refreshed,
            redirect_url: redirect.redirect_url,
        })
    }

    /// Opens a provider session for an existing order and points the order at it.
    ///
    /// Provider errors and timeouts are recorded as a failed attempt and surface as
    /// `PAYMENT_REQUEST_FAILED`; the order itself is left as it was.
    #[instrument(skip(self, order), fields(order_number = %order.order_number))]
    async fn request_session(&self, order: &order::Model) -> Result<PaymentRedirect, ServiceError> {
        let provider = self.gateway.provider_name();
        let request = SessionRequest {
            order_id: order.id,
            order_number: order.order_number.clone(),
            amount: order.total_amount,
            currency: order.currency.clone(),
            callback_url: self.settings.callback_url.clone(),
            description: format!("Order {}", order.order_number),
        };

        let result = timeout(
            self.settings.gateway_timeout,
            self.gateway.request_session(request),
        )
        .await
        .unwrap_or(Err(ProviderError::Timeout));

        match result {
            Ok(session) => {
                let attempt = self
                    .orders
                    .record_session(order.id, provider, &session.session_token, order.total_amount)
                    .await
                    .map_err(|e| e.for_order(&order.order_number))?;

                counter!("checkout.payment.sessions", 1, "provider" => provider);
                self.event_sender
                    .send_or_log(Event::PaymentSessionRequested {
                        order_id: order.id,
                        attempt_id: attempt.id,
                        provider: provider.to_string(),
                    })
                    .await;

                Ok(PaymentRedirect {
                    order_number: order.order_number.clone(),
                    redirect_url: session.redirect_url,
                })
            }
            Err(err) => {
                warn!(error = %err, order_id = %order.id, "payment session request failed");
                counter!("checkout.payment.session_failures", 1, "provider" => provider);

                match self
                    .orders
                    .record_failed_session(order.id, provider, order.total_amount, &err.to_string())
                    .await
                {
                    Ok(attempt) => {
                        self.event_sender
                            .send_or_log(Event::PaymentSessionFailed {
                                order_id: order.id,
                                attempt_id: attempt.id,
                                reason: err.to_string(),
                            })
                            .await
                    }
                    Err(record_err) => {
                        error!(error = %record_err, order_id = %order.id, "could not record failed payment attempt")
                    }
                }

                Err(ServiceError::checkout(
                    CheckoutErrorCode::PaymentRequestFailed,
                    "The payment provider could not be reached, please retry payment",
                )
                .for_order(&order.order_number))
            }
        }
    }

    /// Requests a new session for an unpaid order without re-pricing it.
    #[instrument(skip(self))]
    pub async fn retry_payment(
        &self,
        order_number: &str,
        owner_id: Uuid,
    ) -> Result<PaymentRedirect, ServiceError> {
        let details = self.orders.find_by_order_number(order_number, owner_id).await?;
        if details.order.status.is_terminal() {
            return Err(already_finalized(&details.order));
        }
        self.request_session(&details.order).await
    }

    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        order_number: &str,
        owner_id: Uuid,
    ) -> Result<order::Model, ServiceError> {
        let order = self.orders.cancel(order_number, owner_id).await?;
        self.event_sender
            .send_or_log(Event::OrderCancelled {
                order_id: order.id,
                order_number: order.order_number.clone(),
            })
            .await;
        Ok(order)
    }

    /// Settles the payment attempt identified by the provider's session token.
    ///
    /// Safe to replay: once the order is paid every further call is rejected with
    /// `ORDER_ALREADY_FINALIZED` without contacting the provider.
    #[instrument(skip(self, session_token, provider_reference))]
    pub async fn complete_from_callback(
        &self,
        session_token: &str,
        provider_reference: Option<String>,
        status: CallbackStatus,
    ) -> Result<SettledPayment, ServiceError> {
        let session_token = session_token.trim();
        if session_token.is_empty() {
            return Err(unknown_session());
        }

        let attempt = self
            .orders
            .find_attempt_by_token(session_token)
            .await?
            .ok_or_else(unknown_session)?;
        let order = self
            .orders
            .find_by_id(attempt.order_id)
            .await?
            .ok_or_else(unknown_session)?;

        if order.status.is_terminal() {
            info!(order_number = %order.order_number, status = %order.status, "callback for a finalized order");
            return Err(already_finalized(&order));
        }
        if attempt.status == PaymentAttemptStatus::Failed {
            return Err(ServiceError::checkout(
                CheckoutErrorCode::PaymentVerificationFailed,
                attempt
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "This payment attempt has already failed".to_string()),
            )
            .for_order(&order.order_number));
        }

        let verify = VerifyRequest {
            session_token: session_token.to_string(),
            provider_reference,
            callback_status: status,
            amount: order.total_amount,
        };
        let outcome = timeout(self.settings.gateway_timeout, self.gateway.verify(verify))
            .await
            .unwrap_or(Err(ProviderError::Timeout));

        match outcome {
            Err(err) => {
                warn!(error = %err, order_number = %order.order_number, "payment verification unavailable");
                Err(ServiceError::checkout(
                    CheckoutErrorCode::PaymentVerificationFailed,
                    "The payment could not be confirmed yet, please try again",
                )
                .for_order(&order.order_number))
            }
            Ok(VerificationOutcome::Verified { transaction_id }) => {
                let outcome = self
                    .orders
                    .mark_paid(order.id, attempt.id, &transaction_id)
                    .await
                    .map_err(|e| e.for_order(&order.order_number))?;

                if let MarkPaidOutcome::Transitioned {
                    order: paid,
                    coupon_redeemed,
                } = &outcome
                {
                    counter!("checkout.orders.paid", 1);
                    self.event_sender
                        .send_or_log(Event::OrderPaid {
                            order_id: paid.id,
                            order_number: paid.order_number.clone(),
                            transaction_id: transaction_id.clone(),
                        })
                        .await;
                    if let (true, Some(code)) = (*coupon_redeemed, paid.coupon_code.clone()) {
                        self.event_sender
                            .send_or_log(Event::CouponRedeemed {
                                code,
                                order_id: paid.id,
                            })
                            .await;
                    }
                }

                Ok(SettledPayment::from(outcome.order()))
            }
            Ok(VerificationOutcome::Failed { reason }) => {
                let failed = self.orders.mark_payment_failed(attempt.id, &reason).await?;
                counter!("checkout.orders.payment_failed", 1);
                self.event_sender
                    .send_or_log(Event::OrderPaymentFailed {
                        order_id: failed.id,
                        attempt_id: attempt.id,
                        reason: reason.clone(),
                    })
                    .await;

                Err(ServiceError::checkout(
                    CheckoutErrorCode::PaymentVerificationFailed,
                    format!("Payment was not completed: {}", reason),
                )
                .for_order(&failed.order_number))
            }
        }
    }

    pub async fn get_order(
        &self,
        order_number: &str,
        owner_id: Uuid,
    ) -> Result<OrderDetails, ServiceError> {
        self.orders.find_by_order_number(order_number, owner_id).await
    }

    pub async fn list_orders(
        &self,
        owner_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<order::Model>, u64), ServiceError> {
        self.orders.list_for_owner(owner_id, page, per_page).await
    }
}
