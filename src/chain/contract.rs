// RaffleUp contract binding, limited to the calls the settlement agent makes

use alloy::sol;

sol! {
    #[sol(rpc)]
    interface IRaffleUp {
        struct WinnerInfo {
            address winnerAddress;
            uint256[] winningNumbers;
            uint256 amountWon;
        }

        function raffleCount() external view returns (uint256);

        function getWinnersWithNumbers(uint256 raffleId) external view returns (WinnerInfo[] memory);

        function closeRaffle(uint256 raffleId) external;

        function refundRaffle(uint256 raffleId) external;
    }
}
